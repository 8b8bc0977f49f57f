use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use stage_core::{normalize_path, parent_path, relative_to, StageConfig, STAGE_ENTRY_MODULE};
use stage_overlay::OverlayFs;
use stage_vfs::{create_dir_all, FsError, LocalFs};

use crate::diagnostics::{ErrorCollector, ErrorReport};
use crate::host::{AudioChannel, AudioState, LaunchError, ModuleRegistry, ProgramHost};
use crate::params::{LaunchParams, LaunchPlan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Running,
    Resetting,
    /// A reset could not rebuild the tree. Nothing runs again in this process.
    Broken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStep {
    StopProgram,
    QuiesceAudio,
    PurgeModules,
    RecreateDirectories,
    Relaunch,
    ResumeAudio,
}

impl ResetStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetStep::StopProgram => "stop_program",
            ResetStep::QuiesceAudio => "quiesce_audio",
            ResetStep::PurgeModules => "purge_modules",
            ResetStep::RecreateDirectories => "recreate_directories",
            ResetStep::Relaunch => "relaunch",
            ResetStep::ResumeAudio => "resume_audio",
        }
    }
}

impl fmt::Display for ResetStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetOutcome {
    Completed,
    /// Requested while the host was busy; runs as soon as the host call returns.
    Deferred,
    /// Nothing was launched yet.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already launched")]
    AlreadyLaunched,
    #[error("reset already in progress")]
    ResetInProgress,
    #[error("session is broken: {0}")]
    Broken(String),
    #[error("reset failed at {step}: {source}")]
    ResetFailure {
        step: ResetStep,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("launch failed: {0:#}")]
    Launch(anyhow::Error),
}

fn reset_failure(step: ResetStep) -> impl FnOnce(FsError) -> SessionError {
    move |err| SessionError::ResetFailure {
        step,
        source: Box::new(err),
    }
}

/// Owns one program session: the overlay filesystem, the host capabilities
/// and the parameters the program was launched with.
///
/// The state lock is never held while the host runs, so the host may call
/// `reset` from inside `step`, `launch` or `stop`. A reset asked for while the
/// host is busy runs once the host call returns.
pub struct SessionController<F: LocalFs> {
    config: StageConfig,
    fs: Arc<OverlayFs<F>>,
    modules: Arc<dyn ModuleRegistry>,
    audio: Option<Arc<dyn AudioChannel>>,
    host: Mutex<Box<dyn ProgramHost>>,
    state: Mutex<SessionState>,
    plan: Mutex<Option<LaunchPlan>>,
    loop_stopped: AtomicBool,
    pending_resume: AtomicBool,
    host_busy: AtomicBool,
    reset_requested: AtomicBool,
    errors: Mutex<ErrorCollector>,
    last_error: Mutex<Option<ErrorReport>>,
}

impl<F: LocalFs> SessionController<F> {
    pub fn new(
        config: StageConfig,
        fs: Arc<OverlayFs<F>>,
        modules: Arc<dyn ModuleRegistry>,
        host: Box<dyn ProgramHost>,
    ) -> Self {
        let flush_after = Duration::from_millis(config.error_flush_ms);
        Self {
            config,
            fs,
            modules,
            audio: None,
            host: Mutex::new(host),
            state: Mutex::new(SessionState::Uninitialized),
            plan: Mutex::new(None),
            loop_stopped: AtomicBool::new(false),
            pending_resume: AtomicBool::new(false),
            host_busy: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            errors: Mutex::new(ErrorCollector::new(flush_after)),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioChannel>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<OverlayFs<F>> {
        &self.fs
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn plan(&self) -> Option<LaunchPlan> {
        lock(&self.plan).clone()
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        lock(&self.last_error).clone()
    }

    pub fn is_loop_stopped(&self) -> bool {
        self.loop_stopped.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    /// Creates the working root, enters it and starts the program.
    pub fn launch(&self, params: &LaunchParams) -> Result<(), SessionError> {
        let plan = LaunchPlan::from_params(params).map_err(SessionError::Launch)?;
        {
            let mut state = self.lock_state();
            match &*state {
                SessionState::Uninitialized => {}
                SessionState::Broken(reason) => return Err(SessionError::Broken(reason.clone())),
                _ => return Err(SessionError::AlreadyLaunched),
            }
            *state = SessionState::Running;
            self.host_busy.store(true, Ordering::SeqCst);
        }
        *lock(&self.plan) = Some(plan.clone());

        info!(
            command = plan.command.as_str(),
            working_root = %self.config.working_root,
            content_root = %self.config.content_root,
            "launching session"
        );
        let result = {
            let mut host = lock(&self.host);
            self.run_plan(host.as_mut(), &plan)
        };

        let deferred = self.finish_host_call();
        if let Err(err) = result {
            *self.lock_state() = SessionState::Uninitialized;
            *lock(&self.plan) = None;
            return Err(SessionError::Launch(err));
        }
        if deferred {
            self.reset()?;
        }
        Ok(())
    }

    /// Runs one main-loop iteration. Returns `false` when nothing ran because
    /// the session is not running or its loop is stopped.
    pub fn step(&self) -> Result<bool, SessionError> {
        {
            let state = self.lock_state();
            match &*state {
                SessionState::Running => {}
                SessionState::Broken(reason) => return Err(SessionError::Broken(reason.clone())),
                _ => return Ok(false),
            }
            if self.loop_stopped.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.host_busy.store(true, Ordering::SeqCst);
        }

        let result = lock(&self.host).step();
        let deferred = self.finish_host_call();
        if let Err(err) = result {
            warn!(error = %format!("{:#}", err), "program step failed; stopping main loop");
            self.loop_stopped.store(true, Ordering::SeqCst);
            self.record_error(ErrorReport::new(format!("{:#}", err)));
        }
        if deferred {
            self.reset()?;
        }
        Ok(true)
    }

    /// Runs deferred work: the audio resume scheduled by a reset and any error
    /// batch whose flush window has passed.
    pub fn pump(&self) {
        self.pump_at(Instant::now());
    }

    pub fn pump_at(&self, now: Instant) {
        if self.pending_resume.swap(false, Ordering::SeqCst) {
            if let Some(audio) = &self.audio {
                if audio.state() == AudioState::Suspended {
                    debug!(step = %ResetStep::ResumeAudio, "resuming audio");
                    audio.resume();
                }
            }
        }
        loop {
            let ready = lock(&self.errors).take_ready(now);
            match ready {
                Some(report) => self.record_error(report),
                None => break,
            }
        }
    }

    pub fn report_stderr(&self, chunk: &str) {
        self.report_stderr_at(chunk, Instant::now());
    }

    /// Feeds program stderr to the error collector. A captured traceback stops
    /// the main loop until the next reset.
    pub fn report_stderr_at(&self, chunk: &str, now: Instant) {
        if lock(&self.errors).push(chunk, now) {
            self.loop_stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Tears the session down and starts it again with the launch parameters.
    pub fn reset(&self) -> Result<ResetOutcome, SessionError> {
        {
            let mut state = self.lock_state();
            match &*state {
                SessionState::Uninitialized => return Ok(ResetOutcome::Skipped),
                SessionState::Resetting => return Err(SessionError::ResetInProgress),
                SessionState::Broken(reason) => return Err(SessionError::Broken(reason.clone())),
                SessionState::Running => {}
            }
            if self.host_busy.load(Ordering::SeqCst) {
                self.reset_requested.store(true, Ordering::SeqCst);
                debug!("reset requested while host is busy; deferring");
                return Ok(ResetOutcome::Deferred);
            }
            *state = SessionState::Resetting;
        }

        let started = Instant::now();
        match self.run_reset() {
            Ok(()) => {
                *self.lock_state() = SessionState::Running;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "session reset");
                Ok(ResetOutcome::Completed)
            }
            Err(err) => {
                error!(error = %err, "session reset failed; session is broken");
                *self.lock_state() = SessionState::Broken(err.to_string());
                Err(err)
            }
        }
    }

    fn finish_host_call(&self) -> bool {
        let _state = self.lock_state();
        self.host_busy.store(false, Ordering::SeqCst);
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    fn record_error(&self, report: ErrorReport) {
        *lock(&self.last_error) = Some(report);
    }

    fn run_reset(&self) -> Result<(), SessionError> {
        lock(&self.errors).clear();
        *lock(&self.last_error) = None;

        let mut host = lock(&self.host);

        debug!(step = %ResetStep::StopProgram, "stopping program");
        self.loop_stopped.store(true, Ordering::SeqCst);
        host.stop();

        let quiesced = self.quiesce_audio();

        self.purge_modules();

        debug!(step = %ResetStep::RecreateDirectories, "recreating directories");
        let purged = self.fs.purge_session();
        debug!(purged, "overlay ledger cleared");
        self.recreate_directories()
            .map_err(reset_failure(ResetStep::RecreateDirectories))?;

        debug!(step = %ResetStep::Relaunch, "relaunching program");
        self.loop_stopped.store(false, Ordering::SeqCst);
        let plan = lock(&self.plan).clone();
        if let Some(plan) = plan {
            self.run_plan(host.as_mut(), &plan)
                .map_err(|err| SessionError::ResetFailure {
                    step: ResetStep::Relaunch,
                    source: err.into(),
                })?;
        }

        if quiesced {
            self.pending_resume.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn quiesce_audio(&self) -> bool {
        let Some(audio) = &self.audio else {
            return false;
        };
        if audio.state() != AudioState::Running {
            return false;
        }
        debug!(
            step = %ResetStep::QuiesceAudio,
            wait_ms = self.config.audio_quiesce_ms,
            "quiescing audio"
        );
        thread::sleep(Duration::from_millis(self.config.audio_quiesce_ms));
        audio.suspend();
        true
    }

    fn purge_modules(&self) {
        debug!(step = %ResetStep::PurgeModules, "purging modules");
        let mut removed = 0usize;
        for module in self.modules.loaded_modules() {
            let session_owned = module.name == STAGE_ENTRY_MODULE
                || module.file.as_deref().is_some_and(|file| {
                    relative_to(&self.config.working_root, file).is_some()
                        || relative_to(&self.config.scratch_dir, file).is_some()
                });
            if !session_owned {
                continue;
            }
            match self.modules.unregister(&module.name) {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    module = %module.name,
                    error = %format!("{:#}", err),
                    "failed to unregister module; leaving it loaded"
                ),
            }
        }
        self.modules.invalidate_caches();
        self.modules.install_entry_module(STAGE_ENTRY_MODULE);
        debug!(removed, "modules purged");
    }

    /// Always operates on the tree under the overlay; nothing here should
    /// trigger a fetch.
    fn recreate_directories(&self) -> Result<(), FsError> {
        let inner = self.fs.inner();
        inner.chdir("/")?;
        for dir in [&self.config.scratch_dir, &self.config.working_root] {
            match inner.remove_tree(dir) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            create_dir_all(inner, dir)?;
        }
        inner.chdir(&self.config.working_root)
    }

    fn run_plan(&self, host: &mut dyn ProgramHost, plan: &LaunchPlan) -> anyhow::Result<()> {
        let root = &self.config.working_root;
        let inner = self.fs.inner();
        create_dir_all(inner, root)?;
        self.fs.chdir(root)?;

        if !plan.packages.is_empty() {
            host.install_packages(&plan.packages)?;
        }
        if plan.virtual_gamepad {
            host.enable_virtual_gamepad()?;
        }
        if let Some(file) = &plan.inline_file {
            let path = normalize_path(&file.name, root);
            if let Some(parent) = parent_path(&path) {
                create_dir_all(inner, parent)?;
            }
            self.fs.write_file(&path, &file.bytes)?;
            debug!(path = %path, size = file.size, "wrote inline file");
        }

        match host.launch(&plan.invocation) {
            Ok(()) => Ok(()),
            Err(LaunchError::Program(message)) => {
                warn!(error = %message, "program raised during launch");
                self.record_error(ErrorReport::new(message));
                Ok(())
            }
            Err(LaunchError::Host(err)) => Err(err),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LoadedModule, MemoryModuleRegistry};
    use crate::params::{LaunchCommand, ProgramInvocation};
    use stage_overlay::{PathResolver, StaticFetcher};
    use stage_vfs::{FileHandle, Metadata, MemFs, OpenFlags};
    use std::sync::Weak;

    type Journal = Arc<Mutex<Vec<String>>>;
    type Hook = Arc<Mutex<Option<Box<dyn FnOnce() -> String + Send>>>>;

    const ROOT: &str = "/stage_working_directory";

    fn record(journal: &Journal, entry: impl Into<String>) {
        journal.lock().expect("journal lock").push(entry.into());
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().expect("journal lock").clone()
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum HookPoint {
        Stop,
        Step,
    }

    struct JournalHost {
        journal: Journal,
        hook: Hook,
        hook_point: HookPoint,
        program_error: Option<String>,
        host_error_on_launch: Option<usize>,
        launches: usize,
        fail_step: bool,
    }

    impl JournalHost {
        fn fire(&self, point: HookPoint) {
            if self.hook_point != point {
                return;
            }
            let hook = self.hook.lock().expect("hook lock").take();
            if let Some(hook) = hook {
                let entry = hook();
                record(&self.journal, entry);
            }
        }
    }

    impl ProgramHost for JournalHost {
        fn install_packages(&mut self, packages: &[String]) -> anyhow::Result<()> {
            record(&self.journal, format!("host.packages:{}", packages.join(",")));
            Ok(())
        }

        fn enable_virtual_gamepad(&mut self) -> anyhow::Result<()> {
            record(&self.journal, "host.gamepad");
            Ok(())
        }

        fn launch(&mut self, invocation: &ProgramInvocation) -> Result<(), LaunchError> {
            let kind = match invocation {
                ProgramInvocation::RunScript { .. } => "run_script",
                ProgramInvocation::RunSource { .. } => "run_source",
                ProgramInvocation::PlayApp { .. } => "play_app",
                ProgramInvocation::EditResource { .. } => "edit_resource",
                ProgramInvocation::PlayMml { .. } => "play_mml",
                ProgramInvocation::Idle => "idle",
            };
            record(&self.journal, format!("host.launch:{kind}"));
            self.launches += 1;
            if self.host_error_on_launch == Some(self.launches) {
                return Err(LaunchError::Host(anyhow::anyhow!("runtime gone")));
            }
            match &self.program_error {
                Some(message) => Err(LaunchError::Program(message.clone())),
                None => Ok(()),
            }
        }

        fn step(&mut self) -> anyhow::Result<()> {
            record(&self.journal, "host.step");
            self.fire(HookPoint::Step);
            if self.fail_step {
                anyhow::bail!("IndexError: list index out of range");
            }
            Ok(())
        }

        fn stop(&mut self) {
            record(&self.journal, "host.stop");
            self.fire(HookPoint::Stop);
        }
    }

    struct JournalRegistry {
        inner: MemoryModuleRegistry,
        journal: Journal,
    }

    impl ModuleRegistry for JournalRegistry {
        fn loaded_modules(&self) -> Vec<LoadedModule> {
            self.inner.loaded_modules()
        }

        fn unregister(&self, name: &str) -> anyhow::Result<()> {
            record(&self.journal, format!("modules.unregister:{name}"));
            self.inner.unregister(name)
        }

        fn invalidate_caches(&self) {
            record(&self.journal, "modules.invalidate");
            self.inner.invalidate_caches();
        }

        fn install_entry_module(&self, name: &str) {
            record(&self.journal, format!("modules.install_entry:{name}"));
            self.inner.install_entry_module(name);
        }
    }

    struct JournalAudio {
        state: Mutex<AudioState>,
        journal: Journal,
    }

    impl AudioChannel for JournalAudio {
        fn state(&self) -> AudioState {
            *self.state.lock().expect("audio lock")
        }

        fn suspend(&self) {
            record(&self.journal, "audio.suspend");
            *self.state.lock().expect("audio lock") = AudioState::Suspended;
        }

        fn resume(&self) {
            record(&self.journal, "audio.resume");
            *self.state.lock().expect("audio lock") = AudioState::Running;
        }
    }

    /// Removing directories fails once `fail_remove` is set.
    struct FlakyFs {
        inner: MemFs,
        fail_remove: AtomicBool,
    }

    impl LocalFs for FlakyFs {
        fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> stage_vfs::FsResult<FileHandle> {
            self.inner.open(path, flags, mode)
        }
        fn stat(&self, path: &str) -> stage_vfs::FsResult<Metadata> {
            self.inner.stat(path)
        }
        fn mkdir(&self, path: &str, mode: u32) -> stage_vfs::FsResult<()> {
            self.inner.mkdir(path, mode)
        }
        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
        fn write_file(&self, path: &str, bytes: &[u8]) -> stage_vfs::FsResult<()> {
            self.inner.write_file(path, bytes)
        }
        fn read_file(&self, path: &str) -> stage_vfs::FsResult<Vec<u8>> {
            self.inner.read_file(path)
        }
        fn chdir(&self, path: &str) -> stage_vfs::FsResult<()> {
            self.inner.chdir(path)
        }
        fn cwd(&self) -> String {
            self.inner.cwd()
        }
        fn remove_tree(&self, path: &str) -> stage_vfs::FsResult<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(FsError::InvalidPath(format!("{path} is busy")));
            }
            self.inner.remove_tree(path)
        }
    }

    struct Fixture<F: LocalFs + 'static> {
        controller: Arc<SessionController<F>>,
        journal: Journal,
        modules: Arc<JournalRegistry>,
        audio: Arc<JournalAudio>,
        hook: Hook,
    }

    #[derive(Default)]
    struct HostOptions {
        hook_point: Option<HookPoint>,
        program_error: Option<String>,
        /// The nth host launch (1-based) fails at the host level.
        host_error_on_launch: Option<usize>,
        fail_step: bool,
    }

    fn test_config() -> StageConfig {
        StageConfig {
            audio_quiesce_ms: 1,
            ..StageConfig::default()
        }
    }

    fn fixture_with<F: LocalFs + 'static>(inner: F, options: HostOptions) -> Fixture<F> {
        let config = test_config();
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let hook: Hook = Arc::new(Mutex::new(None));
        let fetcher = StaticFetcher::new()
            .file("main.py", "print('hello')")
            .file("assets/sprite.png", vec![0x89, b'P', b'N', b'G']);
        let fs = Arc::new(OverlayFs::new(
            inner,
            PathResolver::new(&config.working_root, &config.content_root),
            Box::new(fetcher),
        ));
        let modules = Arc::new(JournalRegistry {
            inner: MemoryModuleRegistry::new(),
            journal: journal.clone(),
        });
        let audio = Arc::new(JournalAudio {
            state: Mutex::new(AudioState::Running),
            journal: journal.clone(),
        });
        let host = JournalHost {
            journal: journal.clone(),
            hook: hook.clone(),
            hook_point: options.hook_point.unwrap_or(HookPoint::Stop),
            program_error: options.program_error,
            host_error_on_launch: options.host_error_on_launch,
            launches: 0,
            fail_step: options.fail_step,
        };
        let controller = SessionController::new(config, fs, modules.clone(), Box::new(host))
            .with_audio(audio.clone());
        Fixture {
            controller: Arc::new(controller),
            journal,
            modules,
            audio,
            hook,
        }
    }

    fn fixture(options: HostOptions) -> Fixture<MemFs> {
        fixture_with(MemFs::new(), options)
    }

    fn arm_reentrant_reset<F: LocalFs + 'static>(fx: &Fixture<F>) {
        let weak: Weak<SessionController<F>> = Arc::downgrade(&fx.controller);
        *fx.hook.lock().expect("hook lock") = Some(Box::new(move || {
            let controller = weak.upgrade().expect("controller alive");
            match controller.reset() {
                Ok(outcome) => format!("reenter:{outcome:?}"),
                Err(err) => format!("reenter:{err}"),
            }
        }));
    }

    fn run_main() -> LaunchParams {
        LaunchParams::new(LaunchCommand::Run).with_name("main.py")
    }

    fn clear(journal: &Journal) {
        journal.lock().expect("journal lock").clear();
    }

    #[test]
    fn launch_prepares_working_root_and_runs_plan() {
        let fx = fixture(HostOptions::default());
        let mut params = run_main();
        params.packages = Some("numpy, pillow".to_string());
        params.gamepad = Some("enabled".to_string());
        params.base64 = Some("aGVsbG8=".to_string());

        fx.controller.launch(&params).expect("launch");

        assert_eq!(fx.controller.state(), SessionState::Running);
        assert_eq!(
            entries(&fx.journal),
            vec!["host.packages:numpy,pillow", "host.gamepad", "host.launch:run_script"]
        );
        let fs = fx.controller.fs();
        assert_eq!(fs.cwd(), ROOT);
        assert_eq!(fs.inner().read_file("/stage_working_directory/main.py").expect("inline"), b"hello");
        assert_eq!(fs.fetch_count(), 0);

        assert!(matches!(
            fx.controller.launch(&params),
            Err(SessionError::AlreadyLaunched)
        ));
    }

    #[test]
    fn invalid_params_leave_session_uninitialized() {
        let fx = fixture(HostOptions::default());
        let err = fx
            .controller
            .launch(&LaunchParams::new(LaunchCommand::Play))
            .expect_err("play without name");
        assert!(matches!(err, SessionError::Launch(_)));
        assert_eq!(fx.controller.state(), SessionState::Uninitialized);
        assert!(entries(&fx.journal).is_empty());
    }

    #[test]
    fn program_error_during_launch_is_reported_not_raised() {
        let fx = fixture(HostOptions {
            program_error: Some("SyntaxError: invalid syntax".to_string()),
            ..HostOptions::default()
        });
        fx.controller.launch(&run_main()).expect("launch");
        assert_eq!(fx.controller.state(), SessionState::Running);
        let report = fx.controller.last_error().expect("error report");
        assert!(report.message.contains("SyntaxError"));
    }

    #[test]
    fn reset_before_launch_is_skipped() {
        let fx = fixture(HostOptions::default());
        assert_eq!(fx.controller.reset().expect("reset"), ResetOutcome::Skipped);
        assert!(entries(&fx.journal).is_empty());
        assert_eq!(fx.controller.state(), SessionState::Uninitialized);
        assert!(!fx.controller.step().expect("step"));
    }

    #[test]
    fn reset_runs_every_step_in_order() {
        let fx = fixture(HostOptions::default());
        fx.controller.launch(&run_main()).expect("launch");

        let fs = fx.controller.fs();
        fs.stat("main.py").expect("remote main.py");
        assert_eq!(fs.fetch_count(), 1);
        fs.write_file("save.dat", b"progress").expect("local save");
        create_dir_all(fs.inner(), "/tmp").expect("scratch");
        fs.write_file("/tmp/cache.bin", b"cache").expect("scratch file");

        let registry = &fx.modules.inner;
        registry.register("game", Some("/stage_working_directory/game.py"));
        registry.register("scratch_mod", Some("/tmp/gen.py"));
        registry.register("json", Some("/usr/lib/python3/json/__init__.py"));
        registry.register("lookalike", Some("/stage_working_directory_old/x.py"));
        registry.register("__main__", None);
        clear(&fx.journal);

        assert_eq!(fx.controller.reset().expect("reset"), ResetOutcome::Completed);

        assert_eq!(
            entries(&fx.journal),
            vec![
                "host.stop",
                "audio.suspend",
                "modules.unregister:__main__",
                "modules.unregister:game",
                "modules.unregister:scratch_mod",
                "modules.invalidate",
                "modules.install_entry:__main__",
                "host.launch:run_script",
            ]
        );
        assert_eq!(fx.controller.state(), SessionState::Running);
        assert!(!fx.controller.is_loop_stopped());

        let inner = fs.inner();
        assert!(inner.stat(ROOT).expect("working root").is_dir());
        assert!(inner.list_dir(ROOT).expect("list").is_empty());
        assert!(inner.list_dir("/tmp").expect("list scratch").is_empty());
        assert_eq!(inner.cwd(), ROOT);
        assert!(fs.entries().is_empty());
        assert_eq!(fs.fetch_count(), 0);

        assert!(!registry.contains("game"));
        assert!(!registry.contains("scratch_mod"));
        assert!(registry.contains("json"));
        assert!(registry.contains("lookalike"));
        assert!(registry.contains("__main__"));
        assert_eq!(registry.cache_generation(), 1);

        assert_eq!(fx.audio.state(), AudioState::Suspended);
        fx.controller.pump();
        assert_eq!(entries(&fx.journal).last().map(String::as_str), Some("audio.resume"));
        assert_eq!(fx.audio.state(), AudioState::Running);

        fs.stat("main.py").expect("re-materialized");
        assert_eq!(fs.fetch_count(), 1);
    }

    #[test]
    fn suspended_audio_is_left_alone() {
        let fx = fixture(HostOptions::default());
        fx.controller.launch(&run_main()).expect("launch");
        *fx.audio.state.lock().expect("audio lock") = AudioState::Suspended;
        clear(&fx.journal);

        fx.controller.reset().expect("reset");
        fx.controller.pump();
        let journal = entries(&fx.journal);
        assert!(!journal.iter().any(|e| e.starts_with("audio.")));
    }

    #[test]
    fn pinned_module_survives_reset() {
        let fx = fixture(HostOptions::default());
        fx.controller.launch(&run_main()).expect("launch");
        fx.modules
            .inner
            .register("native_ext", Some("/stage_working_directory/native_ext.so"));
        fx.modules.inner.pin("native_ext");

        assert_eq!(fx.controller.reset().expect("reset"), ResetOutcome::Completed);
        assert!(fx.modules.inner.contains("native_ext"));
        assert!(entries(&fx.journal).contains(&"host.launch:run_script".to_string()));
    }

    #[test]
    fn reset_while_resetting_is_rejected() {
        let fx = fixture(HostOptions {
            hook_point: Some(HookPoint::Stop),
            ..HostOptions::default()
        });
        fx.controller.launch(&run_main()).expect("launch");
        arm_reentrant_reset(&fx);
        clear(&fx.journal);

        assert_eq!(fx.controller.reset().expect("reset"), ResetOutcome::Completed);
        let journal = entries(&fx.journal);
        assert_eq!(journal[0], "host.stop");
        assert_eq!(journal[1], "reenter:reset already in progress");
        assert_eq!(journal.last().map(String::as_str), Some("host.launch:run_script"));
    }

    #[test]
    fn reset_requested_inside_step_runs_after_step() {
        let fx = fixture(HostOptions {
            hook_point: Some(HookPoint::Step),
            ..HostOptions::default()
        });
        fx.controller.launch(&run_main()).expect("launch");
        arm_reentrant_reset(&fx);
        clear(&fx.journal);

        assert!(fx.controller.step().expect("step"));
        let journal = entries(&fx.journal);
        assert_eq!(journal[0], "host.step");
        assert_eq!(journal[1], "reenter:Deferred");
        assert_eq!(journal[2], "host.stop");
        assert_eq!(journal.last().map(String::as_str), Some("host.launch:run_script"));
        assert_eq!(fx.controller.state(), SessionState::Running);
    }

    #[test]
    fn failed_directory_recreation_breaks_session() {
        let fx = fixture_with(
            FlakyFs {
                inner: MemFs::new(),
                fail_remove: AtomicBool::new(false),
            },
            HostOptions::default(),
        );
        fx.controller.launch(&run_main()).expect("launch");
        fx.controller.fs().inner().fail_remove.store(true, Ordering::SeqCst);
        clear(&fx.journal);

        let err = fx.controller.reset().expect_err("reset must fail");
        assert!(matches!(
            err,
            SessionError::ResetFailure {
                step: ResetStep::RecreateDirectories,
                ..
            }
        ));
        assert!(matches!(fx.controller.state(), SessionState::Broken(_)));
        assert!(!entries(&fx.journal).iter().any(|e| e.starts_with("host.launch")));

        assert!(matches!(fx.controller.reset(), Err(SessionError::Broken(_))));
        assert!(matches!(fx.controller.step(), Err(SessionError::Broken(_))));
        assert!(matches!(
            fx.controller.launch(&run_main()),
            Err(SessionError::Broken(_))
        ));
    }

    #[test]
    fn traceback_stops_loop_and_reports_after_flush() {
        let fx = fixture(HostOptions::default());
        assert!(!fx.controller.step().expect("step before launch"));
        fx.controller.launch(&run_main()).expect("launch");
        assert!(fx.controller.step().expect("step"));

        let t0 = Instant::now();
        fx.controller.report_stderr_at("loading assets", t0);
        assert!(!fx.controller.is_loop_stopped());
        fx.controller
            .report_stderr_at("Traceback (most recent call last):", t0);
        fx.controller
            .report_stderr_at("NameError: name 'pyxel' is not defined", t0);
        assert!(fx.controller.is_loop_stopped());
        assert!(!fx.controller.step().expect("stopped step"));

        fx.controller.pump_at(t0 + Duration::from_millis(50));
        assert!(fx.controller.last_error().is_none());
        fx.controller.pump_at(t0 + Duration::from_millis(100));
        let report = fx.controller.last_error().expect("flushed report");
        assert!(report.message.contains("NameError"));

        fx.controller.reset().expect("reset");
        assert!(fx.controller.last_error().is_none());
        assert!(fx.controller.step().expect("step after reset"));
    }

    #[test]
    fn failing_step_stops_loop_with_report() {
        let fx = fixture(HostOptions {
            fail_step: true,
            ..HostOptions::default()
        });
        fx.controller.launch(&run_main()).expect("launch");
        assert!(fx.controller.step().expect("step ran"));
        assert!(fx.controller.is_loop_stopped());
        let report = fx.controller.last_error().expect("report");
        assert!(report.message.contains("IndexError"));
    }

    #[test]
    fn host_error_during_launch_propagates_and_rolls_back() {
        let fx = fixture(HostOptions {
            host_error_on_launch: Some(1),
            ..HostOptions::default()
        });
        let err = fx.controller.launch(&run_main()).expect_err("host failure");
        assert!(matches!(err, SessionError::Launch(_)));
        assert!(err.to_string().contains("runtime gone"));
        assert_eq!(fx.controller.state(), SessionState::Uninitialized);
        assert!(fx.controller.plan().is_none());
        assert!(fx.controller.last_error().is_none());
        assert_eq!(fx.controller.reset().expect("reset"), ResetOutcome::Skipped);
    }

    #[test]
    fn host_error_during_relaunch_breaks_session() {
        let fx = fixture(HostOptions {
            host_error_on_launch: Some(2),
            ..HostOptions::default()
        });
        fx.controller.launch(&run_main()).expect("first launch");

        let err = fx.controller.reset().expect_err("relaunch failure");
        assert!(matches!(
            err,
            SessionError::ResetFailure {
                step: ResetStep::Relaunch,
                ..
            }
        ));
        assert!(err.to_string().contains("runtime gone"));
        assert!(matches!(fx.controller.state(), SessionState::Broken(_)));
        assert!(matches!(fx.controller.step(), Err(SessionError::Broken(_))));
    }

    #[test]
    fn deferred_resume_skips_audio_already_running() {
        let fx = fixture(HostOptions::default());
        fx.controller.launch(&run_main()).expect("launch");
        fx.controller.reset().expect("reset");
        assert_eq!(fx.audio.state(), AudioState::Suspended);

        *fx.audio.state.lock().expect("audio lock") = AudioState::Running;
        fx.controller.pump();
        assert!(!entries(&fx.journal).contains(&"audio.resume".to_string()));
        assert_eq!(fx.audio.state(), AudioState::Running);
    }

    #[test]
    fn log_line_after_flush_window_stays_out_of_report() {
        let fx = fixture(HostOptions::default());
        fx.controller.launch(&run_main()).expect("launch");
        let t0 = Instant::now();
        fx.controller
            .report_stderr_at("Traceback (most recent call last):", t0);
        fx.controller
            .report_stderr_at("frame 120 rendered", t0 + Duration::from_millis(500));
        fx.controller.pump_at(t0 + Duration::from_millis(500));

        let report = fx.controller.last_error().expect("report");
        assert_eq!(report.message, "Traceback (most recent call last):\n");
    }
}
