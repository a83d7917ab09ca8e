//! Demo host: launches the demo worker, exercises every command once and
//! prints what comes back as JSON lines on stdout.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use servicelink::{
    ChannelListener, HostDispatcher, LocalProcessLauncher, Message, ServiceDescriptor,
    Value, VersionInfo,
};
use servicelink_demo::{COMPUTE, COUNTDOWN, DONE, ECHO};

const WORKER_BIN: &str = "servicelink-demo-worker";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

struct Args {
    worker: Option<PathBuf>,
    timeout: Duration,
    version: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: servicelink-demo [--worker <path>] [--timeout <secs>] [--version]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <path>   Worker executable [default: {WORKER_BIN} next to this binary]");
            eprintln!("  --timeout <secs>  Seconds to wait for READY and replies [default: {DEFAULT_TIMEOUT_SECS}]");
            eprintln!("  --version         Print version information as JSON");
            process::exit(2);
        }
    };

    if args.version {
        match serde_json::to_string(&VersionInfo::new()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }
        return;
    }

    servicelink::logging::init_tracing();

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        worker: None,
        timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        version: false,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                parsed.worker = Some(PathBuf::from(
                    args.get(i).ok_or("--worker requires a value")?,
                ));
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout '{raw}'"))?;
                parsed.timeout = Duration::try_from_secs_f64(secs)
                    .map_err(|_| format!("invalid --timeout '{raw}'"))?;
            }
            "--version" | "-V" => parsed.version = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn default_worker() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the demo host binary")?;
    let dir = exe
        .parent()
        .context("demo host binary has no parent directory")?;
    Ok(dir.join(WORKER_BIN))
}

fn run(args: Args) -> anyhow::Result<()> {
    let worker = match args.worker {
        Some(path) => path,
        None => default_worker()?,
    };
    let (dir, file) = split_worker_path(&worker)?;
    let launcher = LocalProcessLauncher::with_dir(ServiceDescriptor::new("demo", file), dir);

    let inbox: Arc<Mutex<Vec<Message>>> = Arc::default();
    let sink = Arc::clone(&inbox);
    let dispatcher = HostDispatcher::new().with_fallback(move |_: &mut (), msg: &Message| {
        println!("{}", serde_json::to_string(msg)?);
        sink.lock()
            .map_err(|_| anyhow::anyhow!("inbox poisoned"))?
            .push(msg.clone());
        Ok(())
    });

    let mut listener = ChannelListener::new(Box::new(launcher), dispatcher)?;
    listener.start()?;
    listener
        .wait_ready(args.timeout)
        .context("worker never became ready")?;

    listener.send(ECHO, vec!["Hello world".into()])?;
    listener.send(COMPUTE, vec!["6684".into(), "6513".into()])?;
    listener.send(COUNTDOWN, vec![Value::Int(3)])?;
    let token = listener.ping()?;
    tracing::debug!(token, "Sent PING");

    // Wait for the countdown to finish; everything else was sent before it.
    let deadline = Instant::now() + args.timeout;
    while Instant::now() < deadline {
        listener.poll();
        let done = inbox
            .lock()
            .map_err(|_| anyhow::anyhow!("inbox poisoned"))?
            .iter()
            .any(|m| m.command == DONE);
        if done {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    listener.soft_quit()?;
    if !listener.wait_stopped(args.timeout) {
        tracing::warn!("Worker did not acknowledge QUIT");
    }
    listener.stop();
    println!("{}", serde_json::to_string(&listener.status())?);
    Ok(())
}

fn split_worker_path(worker: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let file = worker
        .file_name()
        .with_context(|| format!("worker path {} has no file name", worker.display()))?;
    let dir = match worker.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().context("working directory unavailable")?,
    };
    Ok((dir, PathBuf::from(file)))
}
