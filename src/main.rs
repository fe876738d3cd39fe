use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand, ValueEnum};
use firm::{
    arm11::BootOptions,
    drivers::scaler::ScalerMatrix,
    fs::{FileSystem, HostFs},
    hardware::legacy::{LegacyVideo, Pattern, bgr555},
    hid::HidKeys,
    session::{Session, SessionCommand},
};
use logger::{LogKind, init_logger};
use tracing::info;

#[derive(Parser)]
#[command(name = "openagb")]
#[command(version, about = "GBA legacy mode on a simulated 3DS", long_about = None)]
struct Cli {
    /// Log to a file in the temp dir instead of stdout
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot both CPUs and run legacy frames
    Run {
        /// ROM path inside the work directory
        rom: String,

        /// Plays the SD card: config.json, saves, screenshots, border
        #[arg(short, long, default_value = ".")]
        work_dir: PathBuf,

        /// Frames to present before powering off
        #[arg(short, long, default_value_t = 60)]
        frames: u64,

        /// Overrides the scaler of config.json (0, 1 or 2)
        #[arg(long)]
        scaler: Option<u8>,

        /// Overrides the color profile of config.json (0 is off)
        #[arg(long)]
        color_profile: Option<u8>,

        /// Synthetic picture of the legacy core
        #[arg(long, value_enum, default_value_t = Source::Bars)]
        source: Source,

        /// Raw 240x160 BGR555 frames to show instead of `--source`
        #[arg(long)]
        raw: Option<PathBuf>,

        /// Take a screenshot after this many frames
        #[arg(long)]
        screenshot_at: Option<u64>,
    },

    /// Scaler matrix tools
    Scaler {
        #[command(subcommand)]
        command: ScalerCommands,
    },
}

#[derive(Subcommand)]
enum ScalerCommands {
    /// Turn a text matrix into gba_scaler_matrix.bin
    Compile { input: PathBuf, output: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    Bars,
    Black,
    White,
}

impl Source {
    const fn pattern(self) -> Pattern {
        match self {
            Self::Bars => Pattern::Bars,
            Self::Black => Pattern::Solid(0),
            Self::White => Pattern::Solid(bgr555(31, 31, 31)),
        }
    }
}

struct RunArgs {
    rom: String,
    work_dir: PathBuf,
    frames: u64,
    opts_scaler: Option<u8>,
    opts_color_profile: Option<u8>,
    source: LegacyVideo,
    screenshot_at: Option<u64>,
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let fs: Arc<dyn FileSystem> = Arc::new(HostFs::new(&args.work_dir));
    let opts = BootOptions {
        rom_path: args.rom,
        scaler: args.opts_scaler,
        color_profile: args.opts_color_profile,
    };
    let mut session = Session::start(fs, opts, args.source)?;
    let boot = session.info().clone();
    println!(
        "booted: {:?} save, scaler {}, color correction {}",
        boot.save_type,
        boot.scaler,
        if boot.color_corrected { "on" } else { "off" }
    );

    match args.screenshot_at {
        Some(at) if at < args.frames => {
            session.run_frames(at.max(1))?;
            session.send(SessionCommand::SetKeys {
                keys: HidKeys::SCREENSHOT,
                pressed: true,
            });
            session.run_frames(2)?;
            session.send(SessionCommand::SetKeys {
                keys: HidKeys::SCREENSHOT,
                pressed: false,
            });
            let left = args.frames.saturating_sub(at.max(1) + 2);
            if left > 0 {
                session.run_frames(left)?;
            }
        }
        _ => {
            session.run_frames(args.frames)?;
        }
    }

    let report = session.finish()?;
    println!("{} frames shown, {} screenshots", report.frames, report.screenshots);
    Ok(())
}

fn compile_matrix(input: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(input)?;
    let matrix = ScalerMatrix::parse(&text)?;
    fs::write(output, matrix.to_bin())?;
    info!("scaler matrix written to {}", output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let kind = if cli.log_file { LogKind::FILE } else { LogKind::STDOUT };
    let guard = init_logger(kind)?;
    if let Some(path) = guard.path() {
        println!("logging to {}", path.display());
    }

    match cli.command {
        Commands::Run {
            rom,
            work_dir,
            frames,
            scaler,
            color_profile,
            source,
            raw,
            screenshot_at,
        } => {
            let source = match raw {
                Some(path) => LegacyVideo::from_raw(&fs::read(path)?),
                None => LegacyVideo::new(source.pattern()),
            };
            run(RunArgs {
                rom,
                work_dir,
                frames,
                opts_scaler: scaler,
                opts_color_profile: color_profile,
                source,
                screenshot_at,
            })
        }
        Commands::Scaler {
            command: ScalerCommands::Compile { input, output },
        } => compile_matrix(&input, &output),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_overrides() {
        let cli = Cli::try_parse_from(["openagb", "run", "roms/a.gba", "-f", "10", "--scaler", "2"]).unwrap();
        let Commands::Run {
            rom, frames, scaler, color_profile, ..
        } = cli.command
        else {
            panic!("not a run command");
        };
        assert_eq!(rom, "roms/a.gba");
        assert_eq!(frames, 10);
        assert_eq!(scaler, Some(2));
        assert_eq!(color_profile, None);
    }

    #[test]
    fn white_source_is_full_intensity() {
        assert_eq!(Source::White.pattern(), Pattern::Solid(0x7FFF));
    }
}
