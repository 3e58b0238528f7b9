//! Command-line client for exercising a 9P2000 file server over TCP.

use clap::{Parser, Subcommand};
use ninep::{
    client::{self, AnyWrite, CFid},
    fcall::{Stat, dm, om},
};

#[derive(Debug, Parser)]
#[command(name = "ninep-cli", about = "Talk to a 9P2000 file server")]
struct Cli {
    /// Server address, e.g. tcp!127.0.0.1!564
    #[arg(long, default_value = "tcp!127.0.0.1!564")]
    addr: String,

    /// User name to attach as
    #[arg(long, default_value = "none")]
    uname: String,

    /// Attach name (export tree to mount)
    #[arg(long, default_value = "")]
    aname: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List a directory's contents
    Ls { path: String },
    /// Print a file's stat
    Stat { path: String },
    /// Print a file's contents to stdout
    Read { path: String },
    /// Write stdin-supplied bytes into an existing file at offset 0
    Write { path: String, data: String },
    /// Create `name` under `dir` with the given contents
    Create { dir: String, name: String, data: String },
    /// Append the given contents to the end of an existing file
    Append { path: String, data: String },
    /// Remove a file or empty directory
    Remove { path: String },
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

async fn walk_to(root: &CFid<AnyWrite>, path: &str) -> ninep::Result<CFid<AnyWrite>> {
    let names = split_path(path);
    if names.is_empty() {
        return root.walk(&[]).await;
    }
    root.walk(&names).await
}

async fn run(cli: Cli) -> ninep::Result<()> {
    let root = client::nsmount(&cli.addr, &cli.uname, &cli.aname).await?;

    match cli.cmd {
        Cmd::Ls { path } => {
            let mut dir = walk_to(&root, &path).await?;
            dir.open(om::READ).await?;
            let mut offset = 0u64;
            loop {
                let data = dir.read_at(offset, 8192).await?;
                if data.is_empty() {
                    break;
                }
                offset += data.len() as u64;
                let mut cur = std::io::Cursor::new(data);
                while let Ok(stat) = <Stat as ninep::serialize::Decodable>::decode(&mut cur) {
                    let kind = if stat.mode & dm::DIR != 0 { "d" } else { "-" };
                    println!("{} {:>10} {}", kind, stat.length, stat.name);
                }
            }
        }
        Cmd::Stat { path } => {
            let fid = walk_to(&root, &path).await?;
            let stat = fid.stat().await?;
            println!("{:#?}", stat);
        }
        Cmd::Read { path } => {
            let mut fid = walk_to(&root, &path).await?;
            fid.open(om::READ).await?;
            let mut offset = 0u64;
            loop {
                let data = fid.read_at(offset, 8192).await?;
                if data.is_empty() {
                    break;
                }
                offset += data.len() as u64;
                use std::io::Write;
                std::io::stdout().write_all(&data).map_err(ninep::Error::Io)?;
            }
        }
        Cmd::Write { path, data } => {
            let mut fid = walk_to(&root, &path).await?;
            fid.open(om::WRITE).await?;
            fid.write_at(0, data.as_bytes()).await?;
        }
        Cmd::Create { dir, name, data } => {
            let mut fid = walk_to(&root, &dir).await?;
            fid.create(&name, 0o644, om::WRITE).await?;
            fid.write_at(0, data.as_bytes()).await?;
        }
        Cmd::Append { path, data } => {
            let mut fid = walk_to(&root, &path).await?;
            fid.open(om::WRITE).await?;
            let length = fid.stat().await?.length;
            fid.write_at(length, data.as_bytes()).await?;
        }
        Cmd::Remove { path } => {
            let fid = walk_to(&root, &path).await?;
            fid.remove().await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ninep-cli: {}", e);
        std::process::exit(1);
    }
}
