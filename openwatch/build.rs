use std::{env, fs, path::PathBuf, process::Command};

const OBJECT_NAME: &str = "openwatch";

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_file = out_dir.join(OBJECT_NAME);

    println!("cargo:rerun-if-changed=../openwatch-ebpf/src");
    println!("cargo:rerun-if-env-changed=OPENWATCH_SKIP_EBPF");

    if env::var_os("OPENWATCH_SKIP_EBPF").is_some() {
        println!("cargo:warning=OPENWATCH_SKIP_EBPF set, embedding an empty eBPF object");
        fs::write(&out_file, b"").expect("Failed to write placeholder eBPF object");
        return;
    }

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    };

    let ebpf_dir = PathBuf::from("../openwatch-ebpf");

    // Separate target directory for eBPF to avoid file lock conflicts
    let ebpf_target_dir = out_dir.join("ebpf-target");

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status();

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/{}", bpf_target, OBJECT_NAME));

    match status {
        Ok(status) if status.success() => {
            fs::copy(&ebpf_binary, &out_file).expect("Failed to copy eBPF object file");
        }
        Ok(status) => panic!(
            "eBPF build failed ({}); set OPENWATCH_SKIP_EBPF=1 to build without probes",
            status
        ),
        Err(e) => panic!(
            "Could not run cargo for the eBPF build ({}); set OPENWATCH_SKIP_EBPF=1 to build without probes",
            e
        ),
    }
}
