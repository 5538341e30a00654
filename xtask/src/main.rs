use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "openwatch";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, run and package openwatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the complete binary (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g., aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the binary as root (environment is preserved)
    Run {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Arguments passed through to openwatch
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Package a release binary with an example environment file
    Package {
        /// Target triple
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Run { release, args } => {
            run(release, &args)?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live one level below the workspace root")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    match target {
        Some(t) => root.join("target").join(t).join(profile).join(BINARY),
        None => root.join("target").join(profile).join(BINARY),
    }
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("Building {}...", BINARY);

    // Linux target from a non-Linux host needs `cross`
    let is_cross_compile =
        target.map(|t| t.contains("linux")).unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);

    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    println!("Build complete: {}", binary.display());
    Ok(binary)
}

fn run(release: bool, args: &[String]) -> Result<()> {
    let binary = build(release, None)?;

    // Attaching probes needs CAP_BPF/CAP_PERFMON; sudo -E keeps OPENWATCH_* and RUST_LOG
    let status = Command::new("sudo")
        .arg("-E")
        .arg(&binary)
        .args(args)
        .status()
        .context("Failed to run sudo")?;

    if !status.success() {
        bail!("{} exited with {}", BINARY, status);
    }
    Ok(())
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output_path = root.join(output_dir);
    fs::create_dir_all(&output_path).context("Failed to create output directory")?;

    let arch = target.unwrap_or(env::consts::ARCH);
    let version = env!("CARGO_PKG_VERSION");
    let package_name = format!("{}-{}-{}", BINARY, version, arch);

    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir)?;

    fs::copy(&binary, package_dir.join(BINARY))?;
    fs::write(package_dir.join("openwatch.env.example"), example_env())?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .args(["-czf", &tarball.to_string_lossy(), &package_name])
        .status()
        .context("Failed to create tarball")?;

    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;

    println!("Package created: {}", tarball.display());
    Ok(())
}

fn example_env() -> &'static str {
    r#"# fentry (needs BTF) or kprobe
OPENWATCH_PROBE__MODE=fentry
# log or json
OPENWATCH_OUTPUT__FORMAT=log
# Metrics stay disabled when unset
# OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317
RUST_LOG=info
"#
}
