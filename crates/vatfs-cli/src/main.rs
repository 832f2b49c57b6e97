#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use vatfs_core::{Geometry, Vat};

const DEFAULT_BLOCKS: u64 = 16 * 1024; // 64 MiB of 4 KiB blocks
const DEFAULT_INODES: u64 = 1024;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires an image path");
            };
            let remaining: Vec<String> = args.collect();
            let blocks = flag_value(&remaining, "--blocks")?.unwrap_or(DEFAULT_BLOCKS);
            let inodes = flag_value(&remaining, "--inodes")?.unwrap_or(DEFAULT_INODES);
            mkfs(Path::new(&path), blocks, inodes)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "stat" => {
            let Some(path) = args.next() else {
                bail!("stat requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            stat(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("vatfs\n");
    println!("USAGE:");
    println!("  vatfs mkfs <image-path> [--blocks N] [--inodes N]");
    println!("  vatfs inspect <image-path> [--json]");
    println!("  vatfs stat <image-path> [--json]");
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<u64>> {
    let Some(at) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(at + 1) else {
        bail!("{flag} requires a value");
    };
    let value: u64 = raw
        .parse()
        .with_context(|| format!("{flag} expects an integer, got {raw:?}"))?;
    Ok(Some(value))
}

fn mkfs(path: &Path, total_blocks: u64, inode_count: u64) -> Result<()> {
    let vat = Vat::format(
        path,
        Geometry {
            total_blocks,
            inode_count,
        },
    )
    .with_context(|| format!("failed to format {}", path.display()))?;
    let stat = vat.stat();
    println!(
        "formatted {} ({} blocks of {} bytes, {} inodes, {} blocks free)",
        path.display(),
        stat.total_blocks,
        stat.block_size,
        stat.total_inodes,
        stat.free_blocks
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let vat = Vat::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let sb = vat.superblock();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(sb).context("serialize output")?
        );
    } else {
        println!("block_size: {}", sb.block_size);
        println!("total_blocks: {}", sb.total_blocks);
        println!("inode_count: {}", sb.inode_count);
        println!(
            "block_bitmap: blocks {}..{}",
            sb.block_bitmap_start,
            sb.block_bitmap_start + sb.block_bitmap_blocks
        );
        println!(
            "inode_bitmap: blocks {}..{}",
            sb.inode_bitmap_start,
            sb.inode_bitmap_start + sb.inode_bitmap_blocks
        );
        println!(
            "inode_table: blocks {}..{}",
            sb.inode_table_start,
            sb.inode_table_start + sb.inode_table_blocks
        );
        println!("data_start: {}", sb.data_start);
    }
    Ok(())
}

fn stat(path: &Path, json: bool) -> Result<()> {
    let vat = Vat::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let stat = vat.stat();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stat).context("serialize output")?
        );
    } else {
        println!("block_size: {}", stat.block_size);
        println!("blocks: {} total, {} free", stat.total_blocks, stat.free_blocks);
        println!("inodes: {} total, {} free", stat.total_inodes, stat.free_inodes);
    }
    Ok(())
}
