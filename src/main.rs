//! runspace-coordinator binary entry point: an interactive shell over the
//! loopback engine.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use runspace_coordinator::cli::{self, Args};
use runspace_coordinator::config::Config;
use runspace_coordinator::coordinator::{CoordinatorEvent, ExecutionCoordinator};
use runspace_coordinator::engine::{
    Behavior, DebuggerStopEvent, HostCallbacks, IdlePump, LoopbackCapabilities, LoopbackEngine,
    OutputKind, ResumeAction,
};
use runspace_coordinator::execution::{Command, ExecutionOptions};
use runspace_coordinator::{logging, CoordinatorError};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PROMPT: &str = "PS> ";
const DEBUG_PROMPT: &str = "[DBG]: PS> ";

/// How often the read loop pumps idle work while waiting for input.
const IDLE_PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Console host: stdout for output, a reader thread for stdin.
struct ConsoleHost {
    lines: Mutex<mpsc::Receiver<String>>,
    prompt: Mutex<&'static str>,
    stopped: AtomicBool,
    eof: Arc<AtomicBool>,
}

impl ConsoleHost {
    fn new() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let eof = Arc::new(AtomicBool::new(false));
        let reader_eof = Arc::clone(&eof);
        std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in std::io::stdin().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                reader_eof.store(true, Ordering::SeqCst);
            })?;

        Ok(Self {
            lines: Mutex::new(rx),
            prompt: Mutex::new(PROMPT),
            stopped: AtomicBool::new(false),
            eof,
        })
    }

    fn set_prompt(&self, prompt: &'static str) {
        if let Ok(mut current) = self.prompt.lock() {
            *current = prompt;
        }
    }

    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }
}

impl HostCallbacks for ConsoleHost {
    fn write_output(&self, text: &str, newline: bool, kind: OutputKind) {
        match (kind, newline) {
            (OutputKind::Error, true) => eprintln!("{text}"),
            (OutputKind::Error, false) => eprint!("{text}"),
            (_, true) => println!("{text}"),
            (_, false) => print!("{text}"),
        }
    }

    fn start_read_loop(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn stop_read_loop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn read_line(&self, idle: &dyn IdlePump) -> Option<String> {
        self.stopped.store(false, Ordering::SeqCst);
        let prompt = self.prompt.lock().map(|p| *p).unwrap_or(PROMPT);
        print!("{prompt}");
        let _ = std::io::stdout().flush();

        let lines = self.lines.lock().ok()?;
        loop {
            idle.pump();
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            match lines.recv_timeout(IDLE_PUMP_INTERVAL) {
                Ok(line) => return Some(line),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn demo_engine() -> LoopbackEngine {
    LoopbackEngine::new()
        .with_script(
            "Get-Date",
            Behavior::Output(vec![json!("Monday, January 1, 2024 12:00:00 PM")]),
        )
        .with_script("Start-Sleep", Behavior::Block)
        .with_script("throw", Behavior::Throw("ScriptHalted".to_string()))
        .with_script(
            "Wait-Debugger",
            Behavior::Break(DebuggerStopEvent::at("interactive", 1)),
        )
}

#[tokio::main]
async fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Try 'runspace-coordinator --help' for more information.");
            std::process::exit(2);
        }
    };

    if args.help {
        cli::print_help();
        return;
    }
    if args.version {
        cli::print_version();
        return;
    }

    if let Err(e) = run(&args).await {
        error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args)?;
    logging::init_with_filter(config.log_filter())?;
    info!("runspace-coordinator v{}", env!("CARGO_PKG_VERSION"));

    let host = Arc::new(ConsoleHost::new()?);
    let coordinator = ExecutionCoordinator::initialize(
        Arc::new(demo_engine()),
        true,
        Arc::clone(&host) as Arc<dyn HostCallbacks>,
        Arc::new(LoopbackCapabilities),
        config.coordinator_config()?,
    )
    .await?;
    coordinator.set_debugger_attached(true);

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                coordinator.abort(coordinator.is_debugger_stopped());
            }
        });
    }

    let mut events = coordinator.subscribe();
    let cancel = CancellationToken::new();
    loop {
        let Some(line) = coordinator.read_line(&cancel).await? else {
            if host.is_eof() {
                break;
            }
            continue;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" => break,
            _ => run_command(&coordinator, &host, &mut events, line).await,
        }
    }

    coordinator.dispose().await;
    info!("shell exited");
    Ok(())
}

/// Run one command, switching to a debugger prompt whenever it stops.
async fn run_command(
    coordinator: &ExecutionCoordinator,
    host: &ConsoleHost,
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    line: &str,
) {
    let execution = coordinator.execute(Command::script(line), ExecutionOptions::interactive());
    tokio::pin!(execution);

    loop {
        tokio::select! {
            result = &mut execution => {
                match result {
                    Ok(result) if result.aborted => warn!(command = line, "command aborted"),
                    Ok(_) => {}
                    Err(e) => eprintln!("error: {e}"),
                }
                return;
            }
            event = events.recv() => {
                if let Ok(CoordinatorEvent::DebuggerStop(stop)) = event {
                    debugger_prompt(coordinator, host, &stop).await;
                }
            }
        }
    }
}

/// Read and run debugger commands until the debugger resumes.
async fn debugger_prompt(
    coordinator: &ExecutionCoordinator,
    host: &ConsoleHost,
    stop: &DebuggerStopEvent,
) {
    println!(
        "Hit breakpoint at {}:{}",
        stop.script_path.as_deref().unwrap_or("<unknown>"),
        stop.line.unwrap_or_default()
    );
    host.set_prompt(DEBUG_PROMPT);

    let cancel = CancellationToken::new();
    while coordinator.is_debugger_stopped() {
        let line = match coordinator.read_line(&cancel).await {
            Ok(Some(line)) => line,
            Ok(None) if host.is_eof() => {
                coordinator.resume_debugger(ResumeAction::Continue, true).await;
                break;
            }
            Ok(None) => continue,
            Err(CoordinatorError::FrameExited) => break,
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(action) = resume_action(line) {
            coordinator.resume_debugger(action, true).await;
            break;
        }
        if let Err(e) = coordinator
            .execute(Command::new(line), ExecutionOptions::interactive())
            .await
        {
            eprintln!("error: {e}");
        }
    }

    host.set_prompt(PROMPT);
}

fn resume_action(line: &str) -> Option<ResumeAction> {
    match line {
        "c" | "continue" => Some(ResumeAction::Continue),
        "s" | "stepInto" => Some(ResumeAction::StepInto),
        "v" | "stepOver" => Some(ResumeAction::StepOver),
        "o" | "stepOut" => Some(ResumeAction::StepOut),
        "q" | "quit" => Some(ResumeAction::Stop),
        _ => None,
    }
}
