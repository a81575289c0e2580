use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::calibration;
use rollcall_core::{Embedding, IdentityId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_enrollment(&self, identity: &str) -> zbus::Result<String>;
    async fn submit_sample(&self, handle: &str, image: &[u8]) -> zbus::Result<String>;
    async fn finalize_enrollment(&self, handle: &str) -> zbus::Result<String>;
    async fn cancel_enrollment(&self, handle: &str) -> zbus::Result<()>;
    async fn start_session(&self, roster: &[String], deadline_secs: u32) -> zbus::Result<String>;
    async fn submit_probe(&self, session: &str, image: &[u8]) -> zbus::Result<String>;
    async fn submit_batch(&self, session: &str, images: &[Vec<u8>]) -> zbus::Result<String>;
    async fn set_presence(&self, session: &str, identity: &str, present: bool) -> zbus::Result<()>;
    async fn session_status(&self, session: &str) -> zbus::Result<String>;
    async fn finalize(&self, session: &str) -> zbus::Result<String>;
    async fn verify(&self, identity: &str, image: &[u8]) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_enrolled(&self) -> zbus::Result<String>;
    async fn remove_enrolled(&self, identity: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face enrollment and attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a directory of frames (front, left, right)
    Enroll {
        identity: String,
        /// Directory of frames, submitted in file-name order
        #[arg(short, long)]
        images: PathBuf,
    },
    /// Take attendance for a roster from a directory of frames
    Scan {
        /// Comma-separated identity ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        roster: Vec<String>,
        #[arg(short, long)]
        images: PathBuf,
        /// Scanning deadline in seconds (daemon default when omitted)
        #[arg(short, long)]
        deadline: Option<u32>,
        /// Submit all frames as one batch
        #[arg(long)]
        batch: bool,
        /// Pause between frames
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Mark identities present before finalizing
        #[arg(long, value_delimiter = ',')]
        present: Vec<String>,
        /// Mark identities absent before finalizing
        #[arg(long, value_delimiter = ',')]
        absent: Vec<String>,
    },
    /// Compare one image against an enrolled identity
    Verify { identity: String, image: PathBuf },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove { identity: String },
    /// Show daemon status
    Status,
    /// Recommend a similarity threshold from labelled embeddings
    ///
    /// FILE is JSON: {"identity": [[f32, ...], [f32, ...]], ...}
    Calibrate { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Offline; no daemon needed.
    if let Commands::Calibrate { file } = &cli.command {
        return run_calibrate(file);
    }

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll { identity, images } => run_enroll(&proxy, &identity, &images).await?,
        Commands::Scan {
            roster,
            images,
            deadline,
            batch,
            interval_ms,
            present,
            absent,
        } => {
            let overrides = present
                .into_iter()
                .map(|id| (id, true))
                .chain(absent.into_iter().map(|id| (id, false)))
                .collect();
            let options = ScanOptions {
                deadline: deadline.unwrap_or(0),
                batch,
                interval: Duration::from_millis(interval_ms),
                overrides,
            };
            run_scan(&proxy, roster, &images, options).await?
        }
        Commands::Verify { identity, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("input unavailable: {}", image.display()))?;
            let result: Value = serde_json::from_str(&proxy.verify(&identity, &bytes).await?)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::List => {
            let faces: Vec<Value> = serde_json::from_str(&proxy.list_enrolled().await?)?;
            if faces.is_empty() {
                println!("No identities enrolled");
            }
            for face in faces {
                println!(
                    "{}\tdim={}\tenrolled {}",
                    face["identity"].as_str().unwrap_or("?"),
                    face["dim"],
                    face["enrolled_at"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::Remove { identity } => {
            if proxy.remove_enrolled(&identity).await? {
                println!("Removed {identity}");
            } else {
                println!("{identity} was not enrolled");
            }
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Calibrate { file } => run_calibrate(&file)?,
    }

    Ok(())
}

/// Image files in `dir`, sorted by name.
fn read_frames(dir: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("input unavailable: {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();
    tracing::debug!(dir = %dir.display(), frames = paths.len(), "frames found");
    if paths.is_empty() {
        bail!("input unavailable: no images in {}", dir.display());
    }
    paths
        .into_iter()
        .map(|p| {
            let bytes = std::fs::read(&p)
                .with_context(|| format!("input unavailable: {}", p.display()))?;
            Ok((p, bytes))
        })
        .collect()
}

async fn run_enroll(proxy: &AttendanceProxy<'_>, identity: &str, dir: &Path) -> Result<()> {
    let frames = read_frames(dir)?;
    let handle = proxy.start_enrollment(identity).await?;
    println!("Enrolling {identity} from {} frames", frames.len());

    for (path, bytes) in &frames {
        let outcome: Value = serde_json::from_str(&proxy.submit_sample(&handle, bytes).await?)?;
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        println!(
            "{name}: {} pose={} guidance={} [{}/{}]",
            if outcome["accepted"].as_bool() == Some(true) { "captured" } else { "skipped" },
            outcome["pose"],
            outcome["guidance"],
            outcome["captured"],
            outcome["target"]
        );
        if outcome["stage"] == "done" {
            break;
        }
    }

    match proxy.finalize_enrollment(&handle).await {
        Ok(result) => {
            let face: Value = serde_json::from_str(&result)?;
            println!(
                "Enrolled {} ({}-d)",
                face["identity"].as_str().unwrap_or(identity),
                face["dim"]
            );
            Ok(())
        }
        Err(e) => {
            let _ = proxy.cancel_enrollment(&handle).await;
            Err(e).context("enrollment incomplete; capture more frames and retry")
        }
    }
}

struct ScanOptions {
    /// 0 = daemon default
    deadline: u32,
    batch: bool,
    interval: Duration,
    overrides: Vec<(String, bool)>,
}

async fn run_scan(
    proxy: &AttendanceProxy<'_>,
    roster: Vec<String>,
    dir: &Path,
    options: ScanOptions,
) -> Result<()> {
    let frames = read_frames(dir)?;
    let session = proxy.start_session(&roster, options.deadline).await?;
    println!("Session {session}: {} on roster, {} frames", roster.len(), frames.len());

    if options.batch {
        let images: Vec<Vec<u8>> = frames.into_iter().map(|(_, b)| b).collect();
        let reports: Vec<Value> =
            serde_json::from_str(&proxy.submit_batch(&session, &images).await?)?;
        for report in &reports {
            print_report(report);
        }
    } else {
        for (_, bytes) in &frames {
            let report: Value = serde_json::from_str(&proxy.submit_probe(&session, bytes).await?)?;
            print_report(&report);
            if report["phase"] != "scanning" {
                break;
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    let status: Value = serde_json::from_str(&proxy.session_status(&session).await?)?;
    if status["backend_degraded"].as_bool() == Some(true) {
        eprintln!(
            "warning: extraction backend degraded ({} consecutive failures)",
            status["consecutive_failures"]
        );
    }

    for (identity, present) in &options.overrides {
        proxy.set_presence(&session, identity, *present).await?;
    }

    let report: Value = serde_json::from_str(&proxy.finalize(&session).await?)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_report(report: &Value) {
    if let Some(err) = report["error"].as_str() {
        println!("frame {}: error: {err}", report["seq"]);
        return;
    }
    if !report["discarded"].is_null() {
        println!("frame {}: discarded ({})", report["seq"], report["discarded"]);
        return;
    }
    let confirmed: Vec<&str> = report["newly_confirmed"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    println!(
        "frame {}: {} face(s), {}/{} present{}",
        report["seq"],
        report["detected_faces"],
        report["present"],
        report["roster_size"],
        if confirmed.is_empty() {
            String::new()
        } else {
            format!(", confirmed {}", confirmed.join(", "))
        }
    );
}

fn run_calibrate(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("input unavailable: {}", file.display()))?;
    let raw: BTreeMap<IdentityId, Vec<Vec<f32>>> =
        serde_json::from_str(&text).context("expected {\"identity\": [[f32, ...], ...]}")?;
    let labeled = raw
        .into_iter()
        .map(|(id, vectors)| (id, vectors.into_iter().map(Embedding::new).collect()))
        .collect();
    let result = calibration::calibrate(&labeled)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_is_input_unavailable() {
        let err = read_frames(Path::new("/nonexistent/rollcall-frames")).unwrap_err();
        assert!(err.to_string().contains("input unavailable"));
    }

    #[test]
    fn test_cli_parses_scan() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "scan",
            "--roster",
            "alice,bob",
            "--images",
            "/tmp/frames",
            "--absent",
            "bob",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan { roster, absent, interval_ms, .. } => {
                assert_eq!(roster, vec!["alice", "bob"]);
                assert_eq!(absent, vec!["bob"]);
                assert_eq!(interval_ms, 500);
            }
            _ => panic!("expected scan"),
        }
    }
}
