//! `fatposix` command line: inspect and modify a FAT image file.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{FatPosixConfig, MkfsParams};
use crate::device::FileDisk;
use crate::filesystem::FatFileSystem;
use crate::posix::{PosixDirectory, PosixFile, PosixFileSystem, UtimBuf};
use crate::ramfat::RamFatEngine;

/// Command line arguments.
#[derive(Parser)]
#[command(name = "fatposix")]
#[command(about = "Operate on a FAT image through the POSIX adapter", long_about = None)]
pub struct Cli {
    /// Image file; overrides the config file.
    #[arg(short, long, env = "FATPOSIX_IMAGE")]
    pub image: Option<PathBuf>,

    /// TOML or JSON config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Create (or overwrite) the image and format it.
    Mkfs {
        /// Sector count of the new image.
        #[arg(short, long)]
        sectors: Option<u64>,
        /// Allocation unit size in bytes.
        #[arg(short, long)]
        au_size: Option<u32>,
    },
    /// List a directory.
    Ls {
        /// Directory path.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout.
    Cat {
        /// File path.
        path: String,
    },
    /// Copy a host file into the image.
    Put {
        /// Host file.
        src: PathBuf,
        /// Destination path in the image.
        dest: String,
    },
    /// Create a directory.
    Mkdir {
        /// Directory path.
        path: String,
    },
    /// Remove a file.
    Rm {
        /// File path.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Directory path.
        path: String,
    },
    /// Rename or move an entry.
    Mv {
        /// Existing path.
        from: String,
        /// New path.
        to: String,
    },
    /// Show size, mode and modification time.
    Stat {
        /// Entry path.
        path: String,
    },
    /// Show volume geometry and free space.
    Df,
    /// Set permissions (only the owner-write bit is kept).
    Chmod {
        /// Octal mode.
        mode: String,
        /// Entry path.
        path: String,
    },
    /// Create a file if missing and set its modification time.
    Touch {
        /// File path.
        path: String,
        /// Unix time; defaults to now.
        #[arg(short, long)]
        time: Option<i64>,
    },
}

fn child_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn format_time(time: i64) -> String {
    DateTime::<Utc>::from_timestamp(time, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| time.to_string())
}

impl Cli {
    /// Runs the command, writing its output to `out`.
    pub fn run(self, out: &mut dyn Write) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => FatPosixConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => FatPosixConfig::default(),
        };
        if let Some(image) = self.image {
            config.image = image;
        }
        config.validate()?;

        if let Command::Mkfs { sectors, au_size } = self.command {
            return mkfs(&config, sectors, au_size, out);
        }

        let disk = FileDisk::existing(&config.image, config.sector_size)
            .with_context(|| format!("opening {}", config.image.display()))?;
        let engine = RamFatEngine::with_max_open(config.max_open_files);
        let mut fs = FatFileSystem::new(engine, Arc::new(disk));
        fs.mount(config.mount)?;

        let result = execute(&fs, self.command, out);
        fs.unmount()?;
        result
    }
}

fn mkfs(
    config: &FatPosixConfig,
    sectors: Option<u64>,
    au_size: Option<u32>,
    out: &mut dyn Write,
) -> Result<()> {
    let sectors = sectors.unwrap_or(config.sectors);
    let disk = FileDisk::create(&config.image, config.sector_size, sectors)
        .with_context(|| format!("creating {}", config.image.display()))?;
    let mut fs = FatFileSystem::new(RamFatEngine::new(), Arc::new(disk));
    let mut work = vec![0u8; config.sector_size as usize * 8];
    fs.mkfs(
        MkfsParams::new(&mut work)
            .options(config.format)
            .au_size(au_size.unwrap_or(config.au_size)),
    )?;
    info!("Formatted {}", config.image.display());
    writeln!(
        out,
        "{}: {} sectors of {} bytes",
        config.image.display(),
        sectors,
        config.sector_size
    )?;
    Ok(())
}

fn execute(fs: &FatFileSystem<RamFatEngine>, command: Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Mkfs { .. } => anyhow::bail!("mkfs runs on an unmounted image"),
        Command::Ls { path } => {
            let mut names = Vec::new();
            {
                let mut dir = fs.opendir(&path)?;
                while let Some(entry) = dir.readdir()? {
                    names.push(entry.name().to_string());
                }
                dir.closedir()?;
            }
            for name in names {
                let st = fs.stat(&child_path(&path, &name))?;
                let kind = if st.is_dir() { 'd' } else { '-' };
                let write = if st.is_writable() { 'w' } else { '-' };
                writeln!(
                    out,
                    "{}r{} {:>10} {} {}",
                    kind,
                    write,
                    st.size,
                    format_time(st.mtime),
                    name
                )?;
            }
        }
        Command::Cat { path } => {
            let mut file = fs.open(&path, libc::O_RDONLY)?;
            let mut buf = [0u8; 4096];
            loop {
                let n = PosixFile::read(&mut file, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            file.close()?;
        }
        Command::Put { src, dest } => {
            let data = std::fs::read(&src).with_context(|| format!("reading {}", src.display()))?;
            let mut file = fs.open(&dest, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)?;
            let mut written = 0;
            while written < data.len() {
                let n = PosixFile::write(&mut file, &data[written..])?;
                if n == 0 {
                    anyhow::bail!("volume full after {} of {} bytes", written, data.len());
                }
                written += n;
            }
            file.close()?;
            writeln!(out, "{} bytes written to {}", written, dest)?;
        }
        Command::Mkdir { path } => fs.mkdir(&path, 0o755)?,
        Command::Rm { path } => fs.unlink(&path)?,
        Command::Rmdir { path } => fs.rmdir(&path)?,
        Command::Mv { from, to } => fs.rename(&from, &to)?,
        Command::Stat { path } => {
            let st = fs.stat(&path)?;
            writeln!(out, "size:  {}", st.size)?;
            writeln!(out, "mode:  {:o}", st.mode)?;
            writeln!(out, "mtime: {}", format_time(st.mtime))?;
        }
        Command::Df => {
            let vfs = fs.statvfs()?;
            writeln!(out, "block size:  {}", vfs.f_bsize)?;
            writeln!(out, "blocks:      {}", vfs.f_blocks)?;
            writeln!(out, "free blocks: {}", vfs.f_bfree)?;
            writeln!(out, "name max:    {}", vfs.f_namemax)?;
        }
        Command::Chmod { mode, path } => {
            let mode = u32::from_str_radix(&mode, 8)
                .with_context(|| format!("invalid octal mode {}", mode))?;
            fs.chmod(&path, mode)?;
        }
        Command::Touch { path, time } => {
            fs.open(&path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND)?
                .close()?;
            let time = time.unwrap_or_else(|| Utc::now().timestamp());
            fs.utime(&path, &UtimBuf::at(time))?;
        }
    }
    Ok(())
}
