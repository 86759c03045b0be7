use crate::app::{App, AppView, Panel};
use cfspeed::settings::SettingsField;
use cfspeed::speedtest::{Direction, PhaseKind, TestPhase};
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};

const ACCENT: Color = Color::Rgb(100, 149, 237);
const SUCCESS: Color = Color::Rgb(134, 194, 156);
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220);
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130);
const WARN_DIM: Color = Color::Rgb(130, 110, 80);
const ERROR: Color = Color::Rgb(224, 108, 117);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

/// Everything one panel needs, whatever it measures.
struct MetricView {
    title: &'static str,
    color: Color,
    dim: Color,
    headline: String,
    detail: String,
    progress: f64,
    samples: Vec<f64>,
    unit: &'static str,
}

impl MetricView {
    fn bandwidth(app: &App, direction: Direction) -> Self {
        let (title, color, dim, kind) = match direction {
            Direction::Download => ("Download", SUCCESS, SUCCESS_DIM, PhaseKind::Download),
            Direction::Upload => ("Upload", INFO, INFO_DIM, PhaseKind::Upload),
        };
        let samples = app.samples_mbps(direction);
        let detail = if samples.is_empty() {
            "no samples".to_string()
        } else {
            format!("p{:.0} of {} samples", app.settings.bandwidth_percentile() * 100.0, samples.len())
        };
        Self {
            title,
            color,
            dim,
            headline: format_speed(app.live_mbps(direction)),
            detail,
            progress: app.phase_progress(kind),
            samples,
            unit: "Mbps",
        }
    }

    fn latency(app: &App) -> Self {
        Self {
            title: "Latency",
            color: WARN,
            dim: WARN_DIM,
            headline: app
                .live_ping()
                .map(|ms| format!("{:.1} ms", ms))
                .unwrap_or_else(|| "-".to_string()),
            detail: app
                .live_jitter()
                .map(|ms| format!("jitter {:.1} ms", ms))
                .unwrap_or_else(|| "jitter -".to_string()),
            progress: app.phase_progress(PhaseKind::Latency),
            samples: app.ping_samples.clone(),
            unit: "ms",
        }
    }

    fn for_panel(app: &App, panel: Panel) -> Self {
        match panel {
            Panel::Download => Self::bandwidth(app, Direction::Download),
            Panel::Upload => Self::bandwidth(app, Direction::Upload),
            Panel::Ping => Self::latency(app),
        }
    }
}

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();

    match app.view {
        AppView::Main => {
            let chunks = Layout::vertical([
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(1),
            ])
            .split(area);

            draw_header(frame, chunks[0], app);
            if app.expanded {
                draw_expanded(frame, chunks[1], &MetricView::for_panel(app, app.selected_panel));
            } else {
                draw_panels(frame, chunks[1], app);
            }
            draw_footer(frame, chunks[2], app);
        }
        AppView::Settings => draw_settings_view(frame, area, app),
    }
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(10),
        Constraint::Min(10),
        Constraint::Length(28),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new("cfspeed")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        chunks[0],
    );

    let (status, color) = match app.phase {
        TestPhase::Idle => ("Ready".to_string(), TEXT_MUTED),
        TestPhase::Ping => ("Measuring latency...".to_string(), WARN),
        TestPhase::Download | TestPhase::Upload => {
            let phase = app
                .current_phase
                .map(|p| format!("{} {}", p.kind, format_bytes(p.bytes)))
                .unwrap_or_default();
            let color = if app.phase == TestPhase::Download { SUCCESS } else { INFO };
            (format!("Testing {}...", phase), color)
        }
        TestPhase::Complete => ("Complete".to_string(), ACCENT),
        TestPhase::Failed => ("Failed".to_string(), ERROR),
    };
    frame.render_widget(
        Paragraph::new(status)
            .style(Style::default().fg(color))
            .alignment(Alignment::Center),
        chunks[1],
    );

    let (done, total) = app.overall_progress();
    let mut right = vec![Span::styled(
        format!("phase {}/{}", done, total),
        Style::default().fg(TEXT_SECONDARY),
    )];
    if let Some(client) = app.client.as_ref().filter(|c| !c.colo.is_empty()) {
        right.push(Span::styled(format!(" · {}", client.colo), Style::default().fg(TEXT_MUTED)));
    }
    frame.render_widget(Paragraph::new(Line::from(right)).alignment(Alignment::Right), chunks[2]);
}

fn draw_panels(frame: &mut Frame, area: Rect, app: &App) {
    let panels = Layout::horizontal([
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
    ])
    .split(area);

    for (rect, panel) in panels.iter().zip([Panel::Download, Panel::Upload, Panel::Ping]) {
        let view = MetricView::for_panel(app, panel);
        draw_panel(frame, *rect, &view, app.selected_panel == panel);
    }
}

fn draw_panel(frame: &mut Frame, area: Rect, view: &MetricView, selected: bool) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if selected { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            format!(" {} ", view.title),
            Style::default().fg(if selected { view.color } else { TEXT_SECONDARY }),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(view.headline.as_str())
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(view.detail.as_str())
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );
    draw_progress_bar(frame, chunks[2], view.progress, view.color, view.dim);
    draw_chart(frame, chunks[3], &view.samples, view.color, None);
}

fn draw_expanded(frame: &mut Frame, area: Rect, view: &MetricView) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_ACTIVE))
        .title(Span::styled(format!(" {} ", view.title), Style::default().fg(view.color)));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(4),
    ])
    .split(inner);

    let sep = || Span::styled("  ·  ", Style::default().fg(TEXT_MUTED));
    let mut spans = vec![
        Span::styled(
            view.headline.clone(),
            Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(view.detail.clone(), Style::default().fg(TEXT_SECONDARY)),
    ];
    if let Some((min, avg, max)) = summary(&view.samples) {
        spans.push(sep());
        spans.push(Span::styled(
            format!("min {:.1} · avg {:.1} · max {:.1} {}", min, avg, max, view.unit),
            Style::default().fg(TEXT_MUTED),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), chunks[0]);

    draw_progress_bar(frame, chunks[1], view.progress, view.color, view.dim);
    draw_chart(frame, chunks[2], &view.samples, view.color, Some(view.unit));
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

/// Braille line chart. With a unit it gets labelled axes and a mean line.
fn draw_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: Option<&str>) {
    if data.is_empty() || area.width < 4 || area.height < 2 {
        return;
    }

    let Some((min, avg, max)) = summary(data) else {
        return;
    };
    let range = (max - min).max(0.1);
    let y_min = (min - range * 0.1).max(0.0);
    let y_max = max + range * 0.1;
    let x_max = data.len() as f64;

    let points: Vec<(f64, f64)> = data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect();
    let mean = [(0.0, avg), (x_max, avg)];

    let mut datasets = vec![Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points)];

    let mut x_axis = Axis::default().bounds([0.0, x_max]);
    let mut y_axis = Axis::default().bounds([y_min, y_max]);

    if let Some(unit) = unit {
        datasets.push(
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(TEXT_MUTED))
                .data(&mean),
        );
        x_axis = x_axis.style(Style::default().fg(BORDER));
        y_axis = y_axis.style(Style::default().fg(BORDER)).labels(vec![
            Span::styled(format!("{:.0}", y_min), Style::default().fg(TEXT_MUTED)),
            Span::styled(format!("{:.0} {}", y_max, unit), Style::default().fg(TEXT_MUTED)),
        ]);
    }

    frame.render_widget(Chart::new(datasets).x_axis(x_axis).y_axis(y_axis), area);
}

fn draw_settings_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    let header_block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let header_inner = header_block.inner(chunks[0]);
    frame.render_widget(header_block, chunks[0]);
    frame.render_widget(
        Paragraph::new(format!("Settings · {}", app.settings.base_url))
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        header_inner,
    );

    let content_area = Layout::horizontal([
        Constraint::Length(2),
        Constraint::Min(30),
        Constraint::Length(2),
    ])
    .split(chunks[1])[1];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(content_area);
    frame.render_widget(block, content_area);

    let rows = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Min(0),
    ])
    .split(inner);

    let settings = &app.settings;
    let fields = [
        (SettingsField::Percentile, "Percentile", format!("p{:.0}", settings.percentile)),
        (SettingsField::Timeout, "Timeout", format!("{} s", settings.request_timeout_secs())),
        (SettingsField::MaxRetries, "Max retries", settings.retry.max_retries.to_string()),
    ];
    for (row, (field, label, value)) in rows.iter().zip(fields) {
        draw_setting_row(frame, *row, label, &value, app.selected_setting == field);
    }

    frame.render_widget(
        Paragraph::new("↑↓ select · ←→ adjust · enter done")
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[2],
    );
}

fn draw_setting_row(frame: &mut Frame, area: Rect, label: &str, value: &str, selected: bool) {
    let chunks = Layout::horizontal([Constraint::Length(16), Constraint::Min(10)]).split(area);

    let (label_style, value_text, value_style) = if selected {
        (
            Style::default().fg(ACCENT),
            format!("< {} >", value),
            Style::default().fg(TEXT_PRIMARY),
        )
    } else {
        (
            Style::default().fg(TEXT_SECONDARY),
            value.to_string(),
            Style::default().fg(TEXT_MUTED),
        )
    };

    frame.render_widget(Paragraph::new(format!(" {}", label)).style(label_style), chunks[0]);
    frame.render_widget(Paragraph::new(value_text).style(value_style), chunks[1]);
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    if let Some(error) = &app.error {
        frame.render_widget(
            Paragraph::new(format!("{} · enter retry · q quit", error))
                .style(Style::default().fg(ERROR))
                .alignment(Alignment::Center),
            area,
        );
        return;
    }

    let help = if app.expanded {
        "esc close · q quit"
    } else if app.is_running() {
        "tab select · space expand · esc cancel · q quit"
    } else {
        "enter start · s settings · tab select · space expand · q quit"
    };

    let mut text = help.to_string();
    if app.dropped > 0 {
        text = format!("{} dropped · {}", app.dropped, text);
    }

    frame.render_widget(
        Paragraph::new(text)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

/// (min, mean, max), or `None` for an empty series.
fn summary(data: &[f64]) -> Option<(f64, f64, f64)> {
    if data.is_empty() {
        return None;
    }
    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = data.iter().sum::<f64>() / data.len() as f64;
    Some((min, avg, max))
}

fn format_speed(mbps: Option<f64>) -> String {
    match mbps {
        Some(mbps) if mbps >= 1000.0 => format!("{:.2} Gbps", mbps / 1000.0),
        Some(mbps) if mbps >= 1.0 => format!("{:.1} Mbps", mbps),
        Some(mbps) if mbps > 0.0 => format!("{:.0} Kbps", mbps * 1000.0),
        _ => "-".to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= 1_000_000 => format!("{} MB", b / 1_000_000),
        b if b >= 1_000 => format!("{} kB", b / 1_000),
        b => format!("{} B", b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_formatting_picks_unit() {
        assert_eq!(format_speed(None), "-");
        assert_eq!(format_speed(Some(0.5)), "500 Kbps");
        assert_eq!(format_speed(Some(94.31)), "94.3 Mbps");
        assert_eq!(format_speed(Some(1250.0)), "1.25 Gbps");
    }

    #[test]
    fn byte_sizes_are_compact() {
        assert_eq!(format_bytes(100_000), "100 kB");
        assert_eq!(format_bytes(25_000_000), "25 MB");
        assert_eq!(format_bytes(0), "0 B");
    }

    #[test]
    fn summary_of_series() {
        assert_eq!(summary(&[]), None);
        assert_eq!(summary(&[2.0, 4.0, 6.0]), Some((2.0, 4.0, 6.0)));
    }
}
