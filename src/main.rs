mod config;
mod error;
mod gemini;
mod progress;
mod provider;
mod research;
mod schema;
mod strategy;
mod tree;

use std::fs;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::provider::Provider;
use crate::research::{Mode, ResearchOrchestrator, ResearchProgress, ResearchSettings};
use crate::strategy::{KnowledgeGraph, QueryBandit};
use crate::tree::TreeSnapshot;

#[derive(Parser)]
#[command(name = "deepscout", about = "Iterative deep research from the terminal")]
struct Args {
    /// The research query
    query: String,

    /// Research mode: fast, balanced, or comprehensive
    #[arg(long, default_value = "balanced")]
    mode: String,

    /// Override the planner's breadth recommendation (1-10)
    #[arg(long)]
    breadth: Option<u32>,

    /// Override the planner's depth recommendation (1-5)
    #[arg(long)]
    depth: Option<u32>,

    /// Skip the interactive clarification questions
    #[arg(long)]
    no_clarify: bool,

    /// Skip final report generation
    #[arg(long)]
    no_report: bool,
}

fn display_title() {
    println!(
        r#"
    ╔═══════════════════════════════════════════════════════╗
    ║                 DEEPSCOUT RESEARCH CLI                ║
    ╚═══════════════════════════════════════════════════════╝
    "#
    );
}

fn ask(question: &str) -> Result<String> {
    print!("  {}: ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().to_string())
}

fn count_by_level(node: &TreeSnapshot, level: usize, counts: &mut Vec<(usize, usize)>) {
    if counts.len() <= level {
        counts.resize(level + 1, (0, 0));
    }
    counts[level].0 += 1;
    if matches!(node.status, tree::NodeStatus::Completed) {
        counts[level].1 += 1;
    }
    for child in &node.sub_queries {
        count_by_level(child, level + 1, counts);
    }
}

fn display_summary(snapshot: Option<&TreeSnapshot>, elapsed_secs: u64) {
    println!("\n{}", "=".repeat(72));
    println!("RESEARCH COMPLETED");
    println!("{}", "=".repeat(72));
    println!(
        "Total research time: {} minutes and {} seconds",
        elapsed_secs / 60,
        elapsed_secs % 60
    );
    if let Some(snapshot) = snapshot {
        println!("\nResearch tree overview:");
        let mut counts = Vec::new();
        count_by_level(snapshot, 0, &mut counts);
        for (level, (total, completed)) in counts.iter().enumerate() {
            println!("  Level {}: {}/{} queries completed", level, completed, total);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    display_title();
    let args = Args::parse();
    let config = Config::load();
    let mode = Mode::parse(&args.mode);

    let api_key = match std::env::var(&config.gemini.api_key_env) {
        Ok(key) if !key.is_empty() => key,
        _ => bail!(
            "please set the {} environment variable",
            config.gemini.api_key_env
        ),
    };

    let provider: Arc<dyn Provider> = Arc::new(GeminiClient::new(
        api_key,
        &config.gemini,
        mode.call_timeout(),
    ));

    println!("Setting up research for: {}", args.query);
    println!("Mode: {}", mode.name());

    print!("Analyzing query complexity...");
    io::stdout().flush()?;
    let plan = provider
        .plan(&args.query)
        .await
        .context("could not plan the research")?;
    println!(" done");

    let breadth = args.breadth.unwrap_or(plan.breadth);
    let depth = args.depth.unwrap_or(plan.depth);
    println!("\nAnalysis:");
    println!("  Breadth: {}/10", breadth);
    println!("  Depth: {}/5", depth);
    println!("  {}", plan.explanation);

    // Fold clarification answers into the query the way the researcher
    // would phrase them.
    let combined_query = if args.no_clarify {
        args.query.clone()
    } else {
        let questions = provider.followups(&args.query, 3).await.unwrap_or_default();
        if questions.is_empty() {
            args.query.clone()
        } else {
            println!("\nTo sharpen the research, please answer these questions (enter to skip):");
            let mut answered = Vec::new();
            for question in questions {
                let answer = ask(&question)?;
                if !answer.is_empty() {
                    answered.push(format!("{}: {}", question, answer));
                }
            }
            if answered.is_empty() {
                args.query.clone()
            } else {
                format!(
                    "Initial query: {}\n\nFollow up questions and answers:\n{}",
                    args.query,
                    answered.join("\n")
                )
            }
        }
    };

    println!("\n{}", "=".repeat(72));
    println!("STARTING RESEARCH");
    println!("{}", "=".repeat(72));

    let mut orchestrator = ResearchOrchestrator::new(provider.clone(), mode)
        .with_strategy(Box::new(QueryBandit::new()))
        .with_gap_analysis(Box::new(KnowledgeGraph::new()));
    let mut settings = ResearchSettings::for_mode(mode);
    settings.apply_config(&config.research);
    let results_dir = settings.results_dir.clone();
    orchestrator.override_settings(settings);

    let (tx, mut rx) = mpsc::unbounded_channel();
    orchestrator.set_progress_channel(tx);
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                ResearchProgress::Started => eprintln!("[progress] research started"),
                ResearchProgress::Planning => eprintln!("[progress] generating sub-queries"),
                ResearchProgress::BatchStarted(n, total) => {
                    eprintln!("[progress] batch {}/{}", n, total)
                }
                ResearchProgress::QueryStarted(q) => eprintln!("[progress] searching: {}", q),
                ResearchProgress::QueryCompleted(q, learnings) => {
                    eprintln!("[progress] completed: {} ({} learnings)", q, learnings)
                }
                ResearchProgress::Recursing(parent, follow_up) => {
                    eprintln!("[progress] digging deeper: {} -> {}", parent, follow_up)
                }
                ResearchProgress::Aggregating => eprintln!("[progress] aggregating results"),
                ResearchProgress::Completed(completed, total) => {
                    eprintln!("[progress] done: {}/{} queries completed", completed, total)
                }
            }
        }
    });

    let started = Instant::now();
    let result = orchestrator.run(&combined_query, breadth, depth, &[]).await?;
    drop(orchestrator);
    let _ = printer.await;

    println!("\nLearnings ({}):", result.learnings.len());
    for (i, learning) in result.learnings.iter().enumerate() {
        println!("  {}. {}", i + 1, learning);
    }
    println!("\nSources ({}):", result.sources.len());
    for record in result.sources.values() {
        println!("  - {}: {}", record.title, record.link);
    }

    if !args.no_report {
        println!("\nGenerating final report...");
        let report = provider
            .report(&combined_query, &result.learnings, &result.sources)
            .await
            .context("report generation failed")?;

        let reports_dir = results_dir.join("reports");
        fs::create_dir_all(&reports_dir)
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let report_path = reports_dir.join(format!("report_{}.md", result.sanitized_query));
        fs::write(&report_path, &report)?;

        let elapsed = started.elapsed().as_secs();
        let report_with_footer = format!(
            "{}\n\nTotal research time: {} minutes and {} seconds\n",
            report,
            elapsed / 60,
            elapsed % 60
        );
        fs::write("final_report.md", report_with_footer)?;

        println!("Report saved to:");
        println!("  - final_report.md");
        println!("  - {}", report_path.display());
    }

    display_summary(result.tree.as_ref(), started.elapsed().as_secs());
    println!(
        "\nResearch tree saved to: {}/trees/research_tree_{}.json",
        results_dir.display(),
        result.sanitized_query
    );

    if std::env::var("DEEPSCOUT_DEBUG").is_ok() {
        eprintln!("\nRecent activity:");
        for entry in progress::recent(30) {
            eprintln!("  [{:?}] {}", entry.kind, entry.text);
        }
    }

    Ok(())
}
