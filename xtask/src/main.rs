use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask", about = "nodeward development tasks")]
struct Xtask {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Render man pages for nodeward and each subcommand
    Man {
        #[arg(long, default_value = "target/man")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    match Xtask::parse().task {
        Task::Man { out_dir } => {
            let written = render_man_pages(&out_dir)?;
            println!("Wrote {} man pages to {}", written.len(), out_dir.display());
            Ok(())
        }
    }
}

fn render_man_pages(out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let cmd = nodeward_cli::command();
    let mut written = vec![write_page(out_dir, "nodeward", cmd.clone())?];
    for sub in cmd.get_subcommands() {
        let name = format!("nodeward-{}", sub.get_name());
        written.push(write_page(out_dir, &name, sub.clone().name(name.clone()))?);
    }
    Ok(written)
}

fn write_page(out_dir: &Path, name: &str, cmd: clap::Command) -> Result<PathBuf> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .with_context(|| format!("Failed to render man page for {}", name))?;
    let path = out_dir.join(format!("{}.1", name));
    std::fs::write(&path, buf).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
