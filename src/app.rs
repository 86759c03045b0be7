use anyhow::Result;
use cfspeed::settings::{Settings, SettingsField};
use cfspeed::speedtest::{
    stats, ClientInfo, Direction, HttpTransport, MeasurementPhase, PhaseKind, ProbeResult,
    SpeedTest, SpeedTestResult, TestPhase, TestUpdate,
};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_PING_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppView {
    Main,
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Ping,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Ping,
            Panel::Ping => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Ping,
            Panel::Upload => Panel::Download,
            Panel::Ping => Panel::Upload,
        }
    }
}

pub struct App {
    pub phase: TestPhase,
    pub result: Option<SpeedTestResult>,
    pub error: Option<String>,
    pub client: Option<ClientInfo>,
    pub should_quit: bool,

    // UI state
    pub view: AppView,
    pub selected_panel: Panel,
    pub expanded: bool,

    // Settings
    pub settings: Settings,
    pub selected_setting: SettingsField,

    // Phase tracking
    pub current_phase: Option<MeasurementPhase>,
    pub phase_index: usize,
    pub phase_done: usize,
    pub dropped: usize,
    pub finished: Vec<Direction>,

    // Samples for charts
    pub download_results: Vec<ProbeResult>,
    pub upload_results: Vec<ProbeResult>,
    pub ping_samples: Vec<f64>,

    cancel_tx: Option<mpsc::Sender<()>>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self {
            phase: TestPhase::Idle,
            result: None,
            error: None,
            client: None,
            should_quit: false,
            view: AppView::Main,
            selected_panel: Panel::Download,
            expanded: false,
            settings,
            selected_setting: SettingsField::Percentile,
            current_phase: None,
            phase_index: 0,
            phase_done: 0,
            dropped: 0,
            finished: Vec::new(),
            download_results: Vec::new(),
            upload_results: Vec::new(),
            ping_samples: Vec::new(),
            cancel_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(
            self.phase,
            TestPhase::Idle | TestPhase::Complete | TestPhase::Failed
        )
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match self.view {
            AppView::Main => self.handle_main_key(key),
            AppView::Settings => self.handle_settings_key(key),
        }
    }

    fn handle_main_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Char('s') => {
                if !self.is_running() {
                    self.view = AppView::Settings;
                }
                None
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if !self.is_running() {
                    Some(AppAction::StartTest)
                } else {
                    self.expanded = true;
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.is_running() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    fn handle_settings_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => {
                self.view = AppView::Main;
                None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_setting = self.selected_setting.prev();
                None
            }
            KeyCode::Down | KeyCode::Char('j') | KeyCode::Tab => {
                self.selected_setting = self.selected_setting.next();
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.adjust_setting(-1);
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.adjust_setting(1);
                None
            }
            _ => None,
        }
    }

    fn adjust_setting(&mut self, step: i64) {
        let settings = &mut self.settings;
        match self.selected_setting {
            SettingsField::Percentile => {
                let current = settings.bandwidth_percentile() * 100.0;
                settings.percentile = (current + 5.0 * step as f64).clamp(5.0, 100.0);
            }
            SettingsField::Timeout => {
                let secs = (settings.request_timeout_secs() as i64 + 5 * step).clamp(5, 300);
                settings.request_timeout = Duration::from_secs(secs as u64);
            }
            SettingsField::MaxRetries => {
                let retries = (settings.retry.max_retries as i64 + step).clamp(0, 10);
                settings.retry.max_retries = retries as u32;
            }
        }
    }

    pub fn reset_for_new_test(&mut self) {
        self.phase = TestPhase::Idle;
        self.result = None;
        self.error = None;
        self.client = None;
        self.current_phase = None;
        self.phase_index = 0;
        self.phase_done = 0;
        self.dropped = 0;
        self.finished.clear();
        self.download_results.clear();
        self.upload_results.clear();
        self.ping_samples.clear();
        self.expanded = false;
    }

    pub fn apply_update(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::ClientInfo(info) => self.client = Some(info),
            TestUpdate::PhaseStarted { index, phase } => {
                self.phase = phase.kind.into();
                self.current_phase = Some(phase);
                self.phase_index = index;
                self.phase_done = 0;
            }
            TestUpdate::Latency { ping_ms } => {
                self.ping_samples.push(ping_ms);
                if self.ping_samples.len() > MAX_PING_SAMPLES {
                    self.ping_samples.remove(0);
                }
                self.phase_done += 1;
            }
            TestUpdate::Sample { direction, result } => {
                match direction {
                    Direction::Download => self.download_results.push(result),
                    Direction::Upload => self.upload_results.push(result),
                }
                self.phase_done += 1;
            }
            TestUpdate::Dropped { .. } => {
                self.dropped += 1;
                self.phase_done += 1;
            }
            TestUpdate::DirectionFinished(direction) => {
                if !self.finished.contains(&direction) {
                    self.finished.push(direction);
                }
            }
        }
    }

    fn results(&self, direction: Direction) -> &[ProbeResult] {
        match direction {
            Direction::Download => &self.download_results,
            Direction::Upload => &self.upload_results,
        }
    }

    /// Running percentile over the samples the final report would accept.
    pub fn live_mbps(&self, direction: Direction) -> Option<f64> {
        if let Some(result) = &self.result {
            return Some(match direction {
                Direction::Download => result.download_mbps(),
                Direction::Upload => result.upload_mbps(),
            });
        }
        let samples = stats::qualifying_bps(self.results(direction));
        if samples.is_empty() {
            None
        } else {
            Some(stats::percentile(&samples, self.settings.bandwidth_percentile()) / 1_000_000.0)
        }
    }

    pub fn samples_mbps(&self, direction: Direction) -> Vec<f64> {
        self.results(direction).iter().map(ProbeResult::mbps).collect()
    }

    pub fn live_ping(&self) -> Option<f64> {
        match &self.result {
            Some(result) => Some(result.ping_ms),
            None => self.ping_samples.last().copied(),
        }
    }

    pub fn live_jitter(&self) -> Option<f64> {
        match &self.result {
            Some(result) => Some(result.jitter_ms),
            None if self.ping_samples.len() > 1 => Some(stats::jitter(&self.ping_samples)),
            None => None,
        }
    }

    /// Share of the running phase completed, or 1.0 once a direction is done.
    pub fn phase_progress(&self, kind: PhaseKind) -> f64 {
        if self.phase == TestPhase::Complete {
            return 1.0;
        }
        if let Some(direction) = kind.direction() {
            if self.finished.contains(&direction) {
                return 1.0;
            }
        }
        match self.current_phase {
            Some(phase) if phase.kind == kind => {
                (self.phase_done as f64 / phase.count as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    pub fn overall_progress(&self) -> (usize, usize) {
        let total = self.settings.phases.len();
        match self.phase {
            TestPhase::Complete => (total, total),
            _ if self.current_phase.is_some() => (self.phase_index + 1, total),
            _ => (0, total),
        }
    }

    pub fn complete_test(&mut self, result: SpeedTestResult) {
        self.result = Some(result);
        self.phase = TestPhase::Complete;
        self.cancel_tx = None;
    }

    pub fn fail_test(&mut self, error: String) {
        self.error = Some(error);
        self.phase = TestPhase::Failed;
        self.cancel_tx = None;
    }

    pub fn set_cancel_tx(&mut self, tx: mpsc::Sender<()>) {
        self.cancel_tx = Some(tx);
    }

    pub fn cancel_test(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
        self.phase = TestPhase::Idle;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
}

pub enum AppEvent {
    Progress(TestUpdate),
    Finished(Result<SpeedTestResult, String>),
}

/// Drives one engine run on its own task and forwards its progress.
pub async fn run_speed_test(
    update_tx: mpsc::Sender<AppEvent>,
    mut cancel_rx: mpsc::Receiver<()>,
    settings: Settings,
) {
    let (progress_tx, mut progress_rx) = mpsc::channel::<TestUpdate>(64);
    let handle = tokio::spawn(async move {
        let transport = HttpTransport::new(&settings)?;
        let result = SpeedTest::new(transport, settings)
            .with_progress(progress_tx)
            .run()
            .await?;
        Ok::<_, anyhow::Error>(result)
    });

    loop {
        tokio::select! {
            Some(()) = cancel_rx.recv() => {
                handle.abort();
                return;
            }
            update = progress_rx.recv() => match update {
                Some(update) => {
                    let _ = update_tx.send(AppEvent::Progress(update)).await;
                }
                None => break,
            },
        }
    }

    let outcome = match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(err) => Err(err.to_string()),
    };
    let _ = update_tx.send(AppEvent::Finished(outcome)).await;
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, KeyModifiers};

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn sample(bps: f64, duration_ms: f64) -> ProbeResult {
        ProbeResult {
            bytes: 100_000,
            bps,
            duration_ms,
            ping_ms: 5.0,
        }
    }

    #[test]
    fn enter_starts_test_when_idle() {
        let mut app = App::new(Settings::default());
        assert!(matches!(
            app.handle_key_event(press(KeyCode::Enter)),
            Some(AppAction::StartTest)
        ));
    }

    #[test]
    fn esc_cancels_running_test() {
        let mut app = App::new(Settings::default());
        app.apply_update(TestUpdate::PhaseStarted {
            index: 0,
            phase: MeasurementPhase::latency(1),
        });
        assert_eq!(app.phase, TestPhase::Ping);
        assert!(matches!(
            app.handle_key_event(press(KeyCode::Esc)),
            Some(AppAction::CancelTest)
        ));
    }

    #[test]
    fn settings_are_clamped() {
        let mut app = App::new(Settings::default());
        app.handle_key_event(press(KeyCode::Char('s')));
        assert_eq!(app.view, AppView::Settings);

        for _ in 0..5 {
            app.handle_key_event(press(KeyCode::Right));
        }
        assert_eq!(app.settings.percentile, 100.0);

        app.handle_key_event(press(KeyCode::Down));
        app.handle_key_event(press(KeyCode::Down));
        for _ in 0..20 {
            app.handle_key_event(press(KeyCode::Left));
        }
        assert_eq!(app.settings.retry.max_retries, 0);
    }

    #[test]
    fn live_speed_ignores_fast_samples() {
        let mut app = App::new(Settings::default());
        assert_eq!(app.live_mbps(Direction::Download), None);

        app.apply_update(TestUpdate::Sample {
            direction: Direction::Download,
            result: sample(900e6, 2.0),
        });
        assert_eq!(app.live_mbps(Direction::Download), None);

        app.apply_update(TestUpdate::Sample {
            direction: Direction::Download,
            result: sample(50e6, 400.0),
        });
        assert_eq!(app.live_mbps(Direction::Download), Some(50.0));
        assert_eq!(app.samples_mbps(Direction::Download), vec![900.0, 50.0]);
    }

    #[test]
    fn phase_progress_counts_probes() {
        let mut app = App::new(Settings::default());
        app.apply_update(TestUpdate::PhaseStarted {
            index: 4,
            phase: MeasurementPhase::download(1_000_000, 8),
        });
        app.apply_update(TestUpdate::Sample {
            direction: Direction::Download,
            result: sample(10e6, 800.0),
        });
        app.apply_update(TestUpdate::Dropped {
            direction: Direction::Download,
            size: 1_000_000,
            reason: "HTTP error 500".into(),
        });
        assert_eq!(app.phase_progress(PhaseKind::Download), 0.25);
        assert_eq!(app.phase_progress(PhaseKind::Upload), 0.0);
        assert_eq!(app.overall_progress(), (5, 14));

        app.apply_update(TestUpdate::DirectionFinished(Direction::Download));
        assert_eq!(app.phase_progress(PhaseKind::Download), 1.0);
    }

    #[test]
    fn failure_stops_run() {
        let mut app = App::new(Settings::default());
        app.apply_update(TestUpdate::PhaseStarted {
            index: 1,
            phase: MeasurementPhase::download(100_000, 1).bypass(),
        });
        app.fail_test("critical calibration measurement failed".into());
        assert_eq!(app.phase, TestPhase::Failed);
        assert!(!app.is_running());
    }
}
