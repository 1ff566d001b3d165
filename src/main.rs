//! libshot: command-line front end for the capture library
//!
//! Useful for checking which backend a session ends up with and for smoke
//! testing captures without writing any code.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use libshot::{
    Capturer, Region,
    util::detect::{plan_backend, session_environment},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "libshot")]
#[command(version, about = "Screen capture for Wayland and X11 sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected session and the backend it maps to
    Detect,
    /// List physical monitors
    ListMonitors {
        /// Print JSON instead of one line per monitor
        #[arg(long)]
        json: bool,
    },
    /// Capture a region or a whole monitor
    Capture {
        /// Region as X,Y,W,H in desktop coordinates
        #[arg(long, value_parser = parse_region, allow_hyphen_values = true)]
        region: Option<Region>,
        /// Monitor number, starting at 1
        #[arg(long, default_value_t = 1)]
        monitor: usize,
        /// Output file path (format from the extension)
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Let the user drag out an area and capture it
    Interactive {
        /// Output file path (format from the extension)
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn parse_region(raw: &str) -> Result<Region, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected X,Y,W,H, got '{}'", raw));
    };

    let x = x.parse::<i32>().map_err(|e| format!("bad X: {}", e))?;
    let y = y.parse::<i32>().map_err(|e| format!("bad Y: {}", e))?;
    let w = w.parse::<u32>().map_err(|e| format!("bad width: {}", e))?;
    let h = h.parse::<u32>().map_err(|e| format!("bad height: {}", e))?;

    Region::new(x, y, w, h).ok_or_else(|| "region must have a non-zero width and height".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; default to info for this crate only
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("libshot=info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let capturer = Capturer::new();

    match cli.command {
        Commands::Detect => {
            let env = session_environment();
            println!("session type: {}", env.session_type());
            println!("desktop:      {}", env.desktop_name());
            println!("display:      {}", env.has_display());
            match plan_backend(&env) {
                Ok(plan) => println!("plan:         {:?}", plan),
                Err(e) => println!("plan:         none ({})", e),
            }

            let kind = capturer.backend_kind().await.context("backend selection failed")?;
            println!("backend:      {}", kind);
        }
        Commands::ListMonitors { json } => {
            let monitors = capturer.list_monitors().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&monitors)?);
            } else {
                for (index, m) in monitors.iter().enumerate() {
                    println!("{}: {}x{}+{}+{}", index + 1, m.width, m.height, m.left, m.top);
                }
            }
        }
        Commands::Capture { region, monitor, out } => {
            let image = capturer.capture(region, monitor).await?;
            save_or_report(image, &out)?;
        }
        Commands::Interactive { out } => {
            let image = capturer.capture_interactive().await?;
            save_or_report(image, &out)?;
        }
    }

    Ok(())
}

fn save_or_report(image: Option<libshot::CapturedImage>, out: &std::path::Path) -> Result<()> {
    let Some(image) = image else {
        eprintln!("Capture cancelled by the user; nothing written");
        return Ok(());
    };
    if out.as_os_str().is_empty() {
        bail!("output path is empty");
    }

    image
        .save(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    let (width, height) = image.dimensions();
    info!("Wrote {}x{} image to {}", width, height, out.display());
    println!("{}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region() {
        assert_eq!(parse_region("10, 20,300,400").unwrap().as_tuple(), (10, 20, 300, 400));
        assert_eq!(parse_region("-5,0,1,1").unwrap().as_tuple(), (-5, 0, 1, 1));
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("1,2,0,4").is_err());
        assert!(parse_region("a,2,3,4").is_err());
    }

    #[test]
    fn test_cli_parses_capture() {
        let cli = Cli::try_parse_from(["libshot", "capture", "--region", "1,2,3,4", "--out", "x.png"]).unwrap();
        match cli.command {
            Commands::Capture { region, monitor, out } => {
                assert_eq!(region.unwrap().as_tuple(), (1, 2, 3, 4));
                assert_eq!(monitor, 1);
                assert_eq!(out, PathBuf::from("x.png"));
            }
            _ => panic!("expected capture"),
        }
    }

    #[test]
    fn test_cli_parses_negative_region_origin() {
        let cli = Cli::try_parse_from(["libshot", "capture", "--region", "-5,0,1,1", "--out", "x.png"]).unwrap();
        match cli.command {
            Commands::Capture { region, .. } => assert_eq!(region.unwrap().as_tuple(), (-5, 0, 1, 1)),
            _ => panic!("expected capture"),
        }
    }
}
