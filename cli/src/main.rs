use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use ntvfs_core::{FileBacking, MountOptions};
use ntvfs_filesystems::ntfs::{mode_string, DirCursor, NtfsObject, ObjectInfo};
use ntvfs_filesystems::{FileAttributes, NtfsVolume};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ntvfs")]
#[command(about = "Inspect NTFS volume images without mounting them", long_about = None)]
struct Cli {
    /// JSON file with mount options
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Allow in-place overwrites of existing file data
    #[arg(long, global = true)]
    read_write: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show volume information
    Info {
        /// NTFS image file or block device
        image: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a directory
    Ls {
        /// NTFS image file or block device
        image: PathBuf,
        /// Path inside the volume
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write file contents to stdout
    Cat {
        /// NTFS image file or block device
        image: PathBuf,
        /// Path inside the volume
        path: String,
    },
    /// Show file or directory attributes
    Stat {
        /// NTFS image file or block device
        image: PathBuf,
        /// Path inside the volume
        path: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a byte range of the volume holds allocated clusters
    Used {
        /// NTFS image file or block device
        image: PathBuf,
        /// Byte offset into the volume (decimal or 0x hex)
        #[arg(value_parser = parse_number)]
        offset: u64,
        /// Length in bytes (decimal or 0x hex)
        #[arg(value_parser = parse_number)]
        length: u64,
    },
    /// Overwrite existing file data in place (needs --read-write)
    Write {
        /// NTFS image file or block device
        image: PathBuf,
        /// Path inside the volume
        path: String,
        /// Byte offset into the file (decimal or 0x hex)
        #[arg(value_parser = parse_number)]
        offset: u64,
        /// File whose contents are written
        source: PathBuf,
    },
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

fn print_entry(name: &str, info: &ObjectInfo) {
    println!(
        "{} {:>12} {} {}",
        mode_string(info.mode),
        info.size,
        format_time(info.modification_time),
        name
    );
}

fn mount(cli: &Cli, image: &Path) -> anyhow::Result<NtfsVolume> {
    let mut options = match &cli.config {
        Some(path) => MountOptions::from_json_file(path)
            .with_context(|| format!("Failed to load mount options from {}", path.display()))?,
        None => MountOptions::default(),
    };
    if cli.read_write {
        options.read_only = false;
    }
    let backing = FileBacking::open_with(image, cli.read_write)
        .with_context(|| format!("Failed to open {}", image.display()))?;
    let volume = NtfsVolume::mount(Box::new(backing), options)
        .with_context(|| format!("Failed to mount {}", image.display()))?;
    Ok(volume)
}

fn show_info(volume: &mut NtfsVolume, json: bool) -> anyhow::Result<()> {
    let info = volume.volume_info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    let geometry = &info.geometry;
    let allocated = volume.allocated_clusters()?;
    let free = geometry.cluster_count.saturating_sub(allocated) * geometry.cluster_size as u64;

    println!("NTFS version {}.{}", info.major_version, info.minor_version);
    println!("  Label: {}", info.label.as_deref().unwrap_or("(none)"));
    println!("  Serial: {:016X}", info.serial_number);
    println!("  Size: {} ({} bytes)", format_size(geometry.volume_size), geometry.volume_size);
    println!("  Free: {}", format_size(free));
    println!("  Cluster size: {} bytes, {} clusters", geometry.cluster_size, geometry.cluster_count);
    println!("  MFT: LCN {:#x}, {} byte records", geometry.mft_lcn, geometry.mft_record_size);
    println!("  MFT mirror: LCN {:#x}", geometry.mft_mirror_lcn);
    println!("  Index node size: {} bytes", geometry.index_node_size);
    println!("  Flags: {:#06x}{}", info.flags, if info.is_dirty() { " (dirty)" } else { "" });
    println!("  Mode: {}", if info.read_only { "read-only" } else { "read-write" });
    Ok(())
}

fn list(volume: &mut NtfsVolume, path: &str) -> anyhow::Result<()> {
    match volume.resolve_path(path)? {
        NtfsObject::Dir(dir) => {
            let mut cursor = DirCursor::new(dir);
            let mut count = 0;
            while let Some(entry) = volume.dir_enumerate(&mut cursor)? {
                print_entry(&entry.name, &entry.info);
                count += 1;
            }
            log::info!("{}: {} entries", path, count);
        }
        NtfsObject::File(file) => {
            let info = volume.query_info(&file)?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            print_entry(&name, &info);
        }
    }
    Ok(())
}

fn cat(volume: &mut NtfsVolume, path: &str) -> anyhow::Result<()> {
    let file = match volume.resolve_path(path)? {
        NtfsObject::File(file) => file,
        NtfsObject::Dir(_) => bail!("{} is a directory", path),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    while offset < file.size() {
        let n = volume.file_read(&file, offset, &mut buf)?;
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
    out.flush()?;
    Ok(())
}

fn stat(volume: &mut NtfsVolume, path: &str, json: bool) -> anyhow::Result<()> {
    let info = match volume.resolve_path(path)? {
        NtfsObject::Dir(dir) => volume.query_dir_info(&dir)?,
        NtfsObject::File(file) => volume.query_info(&file)?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&FileAttributes::from(&info))?);
        return Ok(());
    }
    println!("  Path: {}", path);
    println!("  MFT record: {:#x}", info.inode);
    println!("  Size: {} bytes", info.size);
    println!("  Allocated: {} bytes", info.allocated_size);
    println!("  Mode: {} ({:o})", mode_string(info.mode), info.mode);
    println!("  Attributes: {:#010x}", info.file_attributes);
    println!("  Created: {}", format_time(info.creation_time));
    println!("  Modified: {}", format_time(info.modification_time));
    println!("  Changed: {}", format_time(info.change_time));
    println!("  Accessed: {}", format_time(info.access_time));
    Ok(())
}

fn write_file(volume: &mut NtfsVolume, path: &str, offset: u64, source: &Path) -> anyhow::Result<()> {
    let data = std::fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    let file = match volume.resolve_path(path)? {
        NtfsObject::File(file) => file,
        NtfsObject::Dir(_) => bail!("{} is a directory", path),
    };
    let written = volume.file_write(&file, offset, &data)?;
    volume.flush()?;
    println!("Wrote {} bytes to {} at offset {:#x}", written, path, offset);
    Ok(())
}

impl Commands {
    fn image(&self) -> &Path {
        match self {
            Commands::Info { image, .. }
            | Commands::Ls { image, .. }
            | Commands::Cat { image, .. }
            | Commands::Stat { image, .. }
            | Commands::Used { image, .. }
            | Commands::Write { image, .. } => image,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if matches!(cli.command, Commands::Write { .. }) && !cli.read_write {
        bail!("writing needs --read-write");
    }
    let mut volume = mount(&cli, cli.command.image())?;
    match &cli.command {
        Commands::Info { json, .. } => show_info(&mut volume, *json)?,
        Commands::Ls { path, .. } => list(&mut volume, path)?,
        Commands::Cat { path, .. } => cat(&mut volume, path)?,
        Commands::Stat { path, json, .. } => stat(&mut volume, path, *json)?,
        Commands::Used { offset, length, .. } => {
            let used = volume.query_range_state(*offset, *length)?;
            println!(
                "{:#x} LB {:#x}: {}",
                offset,
                length,
                if used { "allocated" } else { "free" }
            );
        }
        Commands::Write {
            path, offset, source, ..
        } => write_file(&mut volume, path, *offset, source)?,
    }
    Ok(())
}
