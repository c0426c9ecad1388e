use std::env;
use std::path::PathBuf;

use anyhow::Context;
use serde_json::json;

use convoflow::db;
use convoflow::pipeline::batch_files::BatchFileStore;
use convoflow::pipeline::checkpoint::CheckpointTracker;
use convoflow::store::PgConversationStore;

const USAGE: &str = "convoflowctl <command>\n\
Commands:\n\
- pending                 incomplete batches and their retry-queue depth\n\
- retries <batch_id>      print a batch's retry queue\n\
- failures                print the permanent-failure report\n\
- checkpoint              print the checkpoint\n\
- reset-checkpoint        delete the checkpoint\n\
- seed <n>                insert n demo conversations\n\
- migrate                 apply database migrations\n\
\n\
Batch files are read from CONVOFLOW_BATCH_DIR (default ./batch_files).\n\
seed and migrate use DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    match command.as_str() {
        "pending" => pending().await?,
        "retries" => {
            let Some(batch_id) = args.get(2) else {
                eprintln!("usage: convoflowctl retries <batch_id>");
                std::process::exit(2);
            };
            retries(batch_id).await?;
        }
        "failures" => failures().await?,
        "checkpoint" => checkpoint().await?,
        "reset-checkpoint" => {
            CheckpointTracker::reset(&batch_dir()).await?;
            println!("checkpoint reset OK");
        }
        "seed" => {
            let n: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(n).await?;
        }
        "migrate" => {
            let pool = db::make_pool(&database_url()?, 2).await?;
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn batch_dir() -> PathBuf {
    env::var("CONVOFLOW_BATCH_DIR")
        .or_else(|_| env::var("BATCH_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("batch_files"))
}

fn database_url() -> anyhow::Result<String> {
    env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")
}

async fn pending() -> anyhow::Result<()> {
    let files = BatchFileStore::open(batch_dir()).await?;
    let batches = files.list_pending().await?;
    if batches.is_empty() {
        println!("no pending batches");
    }
    for batch in batches {
        let queue = files.read_retry_queue(&batch.batch_id).await?;
        println!(
            "{} ids={}..={} items={} retry_queue={} created_at={}",
            batch.batch_id,
            batch.first_id,
            batch.last_id,
            batch.items.len(),
            queue.len(),
            batch.created_at
        );
    }
    println!(
        "last completed id: {}",
        files
            .last_completed_id()
            .await?
            .map_or_else(|| "none".to_string(), |id| id.to_string())
    );
    Ok(())
}

async fn retries(batch_id: &str) -> anyhow::Result<()> {
    let files = BatchFileStore::open(batch_dir()).await?;
    let queue = files.read_retry_queue(batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&queue)?);
    Ok(())
}

async fn failures() -> anyhow::Result<()> {
    let files = BatchFileStore::open(batch_dir()).await?;
    let report = files.permanent_failures().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn checkpoint() -> anyhow::Result<()> {
    match CheckpointTracker::read(&batch_dir()).await? {
        Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
        None => println!("no checkpoint"),
    }
    Ok(())
}

async fn seed(n: usize) -> anyhow::Result<()> {
    const SAMPLES: [(&str, &str); 4] = [
        ("I was charged twice for my subscription this month", "Sorry about that, refunding now."),
        ("The app crashes every time I open settings", "Which version are you on?"),
        ("How do I change the email on my account?", "Go to Profile > Email."),
        ("My package says delivered but nothing arrived", "Let me open a claim for you."),
    ];

    let store = PgConversationStore::new(db::make_pool(&database_url()?, 2).await?);
    for i in 0..n {
        let (question, answer) = SAMPLES[i % SAMPLES.len()];
        let payload = json!({
            "messages": [
                {"sender": "customer", "content": question},
                {"sender": "agent", "content": answer}
            ]
        });
        let id = store.insert_conversation(payload).await?;
        println!("+ inserted conversation id={id}");
    }
    Ok(())
}
