//! The simulator binary: boots the kernel on the simulated machine and
//! performs whatever the command line asks — formatting, filesystem
//! utilities, running a user executable, or one of the thread
//! demonstrations.

mod thread_test;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rios::system::{self, BootOptions};
use rios::userprog::exception;

/// RIOS, an instructional operating system on a simulated machine.
#[derive(Parser)]
#[command(name = "rios-sim", version, about)]
struct Args {
    /// Format the disk before doing anything else.
    #[arg(short = 'f')]
    format: bool,

    /// Enable debug categories (single letters; `+` for everything).
    #[arg(short = 'd', value_name = "flags", default_value = "")]
    debug: String,

    /// Disk image to attach.
    #[arg(short = 'D', value_name = "image", default_value = "DISK.img")]
    disk: PathBuf,

    /// Run the named executable and wait for it.
    #[arg(short = 'x', value_name = "path")]
    execute: Option<String>,

    /// Copy a host file into the filesystem: -c <host> <path>.
    #[arg(short = 'c', num_args = 2, value_names = ["host", "path"])]
    copy: Option<Vec<String>>,

    /// Print the named file to the console.
    #[arg(short = 'p', value_name = "path")]
    print: Option<String>,

    /// Remove the named file or empty directory.
    #[arg(short = 'r', value_name = "path")]
    remove: Option<String>,

    /// Create the named directory.
    #[arg(long = "mkdir", value_name = "path")]
    mkdir: Option<String>,

    /// List the root directory.
    #[arg(long = "ls")]
    list: bool,

    /// Run the filesystem consistency checker.
    #[arg(long = "chk")]
    check: bool,

    /// Run a thread-test variant (0 simple, 1 producer/consumer,
    /// 2 channels, 3 priority inversion).
    #[arg(long = "tt", value_name = "n")]
    thread_test: Option<usize>,
}

fn copy_in(host: &str, path: &str) -> Result<(), String> {
    let bytes = std::fs::read(host).map_err(|e| format!("reading {host}: {e}"))?;
    let fs = system::file_system();
    fs.create(path, 0, false)
        .map_err(|e| format!("creating {path}: {e:?}"))?;
    let file = fs.open(path).map_err(|e| format!("opening {path}: {e:?}"))?;
    file.write(&bytes).map_err(|e| format!("writing {path}: {e:?}"))?;
    fs.close_handle(&file);
    Ok(())
}

fn print_file(path: &str) -> Result<(), String> {
    let fs = system::file_system();
    let file = fs.open(path).map_err(|e| format!("opening {path}: {e:?}"))?;
    let mut data = vec![0u8; file.length()];
    file.read(&mut data);
    fs.close_handle(&file);
    mirage::print!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let options = BootOptions {
        format: args.format,
        disk_path: Some(args.disk.clone()),
        debug_flags: args.debug.clone(),
    };

    let outcome: Result<(), String> = system::boot(options, || {
        if let Some(test) = args.thread_test {
            thread_test::run(test)?;
        }
        if let Some(pair) = &args.copy {
            copy_in(&pair[0], &pair[1])?;
        }
        if let Some(path) = &args.mkdir {
            system::file_system()
                .mkdir(path)
                .map_err(|e| format!("mkdir {path}: {e:?}"))?;
        }
        if let Some(path) = &args.print {
            print_file(path)?;
        }
        if let Some(path) = &args.remove {
            system::file_system()
                .remove(path)
                .map_err(|e| format!("removing {path}: {e:?}"))?;
        }
        if args.list {
            system::file_system().list();
        }
        if let Some(path) = &args.execute {
            let space_id = exception::exec(path, vec![path.clone()], true)
                .map_err(|e| format!("exec {path}: {e:?}"))?;
            let status = exception::join(space_id as i32);
            mirage::println!("{} exited with status {}", path, status);
        }
        if args.check && !system::file_system().check() {
            return Err("filesystem check failed".to_string());
        }
        Ok(())
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("rios-sim: {message}");
            ExitCode::FAILURE
        }
    }
}
