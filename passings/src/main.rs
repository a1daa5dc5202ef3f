use anyhow::{bail, Context, Result};
use decoder::cfg::SysConf;
use passings::{passing_line, CliArgs, Request};
use std::io::{stdin, stdout, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};
use todtools::Tod;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let args: CliArgs = argh::from_env();
    if args.version {
        let stdout = stdout();
        let mut stdout = stdout.lock();
        writeln!(
            stdout,
            concat!(env!("CARGO_BIN_NAME"), " ", "{}"),
            env!("CARGO_PKG_VERSION"),
        )?;
        return Ok(());
    }
    let kind = match args.kind {
        Some(k) => k,
        None => bail!("no decoder kind given, try --help"),
    };

    // passings go to stdout, logs to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let conf = match args.config.as_deref() {
        Some(path) => SysConf::load(path).with_context(|| format!("could not load config {}", path))?,
        None => SysConf::default(),
    };

    let device = passings::start(kind, &conf)?;
    if let Some(arming) = device.arming.as_ref() {
        arming.armlock(args.armlock);
        for chan in args.arm.iter() {
            if !arming.arm(chan) {
                warn!("unknown channel {:?}", chan);
            }
        }
        info!("armed: {:?}, armlock: {}", arming.channels(), arming.locked());
    } else if !args.arm.is_empty() {
        warn!("{} has no channel arming", kind);
    }

    let (tx, rx) = flume::unbounded::<Tod>();
    device.handle.setcb(move |t| {
        let _ = tx.send(t);
    });
    device.handle.setport(args.port.as_deref());
    if args.sane {
        device.handle.sane();
    }
    if args.sync {
        device.handle.sync();
    }

    let (reqtx, reqrx) = flume::unbounded::<String>();
    thread::Builder::new().name(String::from("stdin")).spawn(move || {
        for line in stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if reqtx.send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })?;

    let deadline = args.duration.map(|d| Instant::now() + Duration::from_secs(d));
    let stdout = stdout();
    loop {
        if deadline.map_or(false, |d| Instant::now() > d) {
            info!("run duration elapsed");
            break;
        }
        if !device.handle.running() {
            warn!("decoder thread stopped");
            break;
        }
        let mut quit = false;
        while let Ok(line) = reqrx.try_recv() {
            match line.parse::<Request>() {
                Ok(req) => {
                    debug!("request {:?}", req);
                    if !device.apply(&req) {
                        quit = true;
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
        if quit {
            break;
        }
        if let Ok(t) = rx.recv_timeout(TICK) {
            let mut out = stdout.lock();
            for t in std::iter::once(t).chain(rx.try_iter()) {
                let line = if args.json {
                    serde_json::to_string(&t)?
                } else {
                    passing_line(&t)
                };
                writeln!(out, "{}", line)?;
            }
            out.flush()?;
        }
    }

    device.handle.exit(Some("finished"));
    device.handle.join();
    Ok(())
}
