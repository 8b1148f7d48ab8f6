//! Finalize a chapter file into a memory archive.
//!
//! Usage: cargo run -p novel-core --example finalize_chapter -- <project> <chapter> <text-file> [archive.json]
//!
//! Loads the archive if it exists, folds the chapter into memory, and saves
//! the archive back. Requires ANTHROPIC_API_KEY.

use claude::Claude;
use novel_core::memory::{InMemoryStore, MemoryArchive, ProjectId};
use novel_core::FinalizationCoordinator;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: finalize_chapter <project> <chapter> <text-file> [archive.json]");
        std::process::exit(2);
    }
    let project = ProjectId::new(args[0].as_str());
    let chapter: u32 = args[1].parse()?;
    let text = tokio::fs::read_to_string(&args[2]).await?;
    let archive_path = PathBuf::from(args.get(3).map(String::as_str).unwrap_or("memory.json"));

    let store = if archive_path.exists() {
        Arc::new(MemoryArchive::load_json(&archive_path).await?.into_store())
    } else {
        Arc::new(InMemoryStore::new())
    };

    let claude = Claude::from_env()?;
    let coordinator = FinalizationCoordinator::new(claude, store.clone());
    let report = coordinator.finalize_chapter(&project, chapter, &text, &[]).await?;

    println!("Chapter {} finalized (memory version {})", chapter, report.new_version);
    println!("  summary rewritten: {}", report.updated.global_summary);
    println!("  plot arcs updated: {}", report.updated.plot_arcs);
    println!("  character states:  {}", report.updated.character_states);
    println!("  timeline events:   {}", report.updated.timeline_events);
    if let Some(summary) = &report.snapshot.chapter_summary {
        println!("\n{summary}");
    }

    MemoryArchive::capture(&store).await.save_json(&archive_path).await?;
    println!("\nSaved {}", archive_path.display());
    Ok(())
}
