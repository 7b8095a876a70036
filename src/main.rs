use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use agrismart::app_state::AppState;
use agrismart::chat::{Conversation, SubmitOutcome};
use agrismart::constants::{DEFAULT_MARKET_QUERY, DEFAULT_PORT};
use agrismart::diagnosis::{DiagnosisDesk, SelectedImage};
use agrismart::gemini::{GeminiClient, GeminiConfig};
use agrismart::market::MarketDesk;
use agrismart::web_server;

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Model used for every request.
    #[arg(long, global = true, env = "AGRISMART_MODEL")]
    model: Option<String>,

    /// Base URL of the model service.
    #[arg(long, global = true, env = "GEMINI_API_BASE")]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the web dashboard.
    Serve {
        #[arg(long, env = "AGRISMART_PORT", default_value_t = DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
    },
    /// Talk to the agricultural advisor in the terminal.
    Chat,
    /// Diagnose a plant from an image file.
    Diagnose {
        /// PNG, JPEG, WebP, GIF or HEIC image of the plant.
        image: PathBuf,
    },
    /// Get search-grounded market insights.
    Market {
        /// Commodity or market topic. Defaults to corn and wheat prices.
        query: Vec<String>,
    },
}

impl Cli {
    fn gemini_config(&self) -> GeminiConfig {
        let mut config = GeminiConfig::from_env();
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(base) = &self.api_base {
            config.base_url = base.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for the API key and overrides)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g. RUST_LOG=info,agrismart=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("AgriSmart starting with command: {:?}", cli.command);

    let client = GeminiClient::new(cli.gemini_config())
        .context("Cannot reach the model service without an API key; set GEMINI_API_KEY")?;

    match cli.command {
        Commands::Serve { port } => serve(port, client).await,
        Commands::Chat => chat(client).await,
        Commands::Diagnose { image } => diagnose(&image, &client).await,
        Commands::Market { query } => market(&query, &client).await,
    }
}

async fn serve(port: u16, client: GeminiClient) -> Result<()> {
    let model = client.model().to_string();
    let app = AppState::new(Arc::new(client));

    let mut web_server_handle = tokio::spawn(async move {
        if let Err(e) = web_server::start_web_server(port, app, model).await {
            error!("Web server failed: {:?}", e);
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Ctrl-C received, shutting down...");
            web_server_handle.abort();
        }
        res = &mut web_server_handle => {
            match res {
                Ok(_) => info!("Web server task completed unexpectedly."),
                Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                Err(e) => error!("Web server task failed: {:?}", e),
            }
        }
    }

    info!("AgriSmart shut down.");
    Ok(())
}

async fn chat(client: GeminiClient) -> Result<()> {
    let mut conversation = Conversation::new();
    if let Some(greeting) = conversation.entries().first() {
        println!("{}", greeting.text);
    }
    println!("(/clear starts over, /quit exits)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                conversation.clear();
                if let Some(greeting) = conversation.entries().first() {
                    println!("{}", greeting.text);
                }
                continue;
            }
            _ => {}
        }

        let outcome = conversation
            .submit(&client, &line, |fragment| {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            })
            .await;
        println!();
        if outcome == SubmitOutcome::Failed {
            if let Some(entry) = conversation.entries().last() {
                println!("{}", entry.text);
            }
        }
    }
    Ok(())
}

async fn diagnose(path: &std::path::Path, client: &GeminiClient) -> Result<()> {
    let image = SelectedImage::from_path(path)
        .with_context(|| format!("Failed to load image {}", path.display()))?;

    let mut desk = DiagnosisDesk::new();
    desk.select_image(image);
    desk.analyze(client).await;
    if let Some(notice) = desk.take_notice() {
        bail!(notice);
    }
    let Some(result) = desk.result() else {
        bail!("Analysis produced no result");
    };

    if let Some(plant) = &result.plant_name {
        println!("Plant:       {}", plant);
    }
    println!("Diagnosis:   {} ({} confidence)", result.diagnosis, result.confidence);
    println!(
        "Status:      {}",
        if result.is_healthy() { "healthy" } else { "needs attention" }
    );
    if !result.is_high_confidence() {
        println!("Note:        low certainty, confirm with a closer photo or an agronomist.");
    }
    println!("Observation: {}", result.observation);
    println!("Treatment:   {}", result.treatment);
    Ok(())
}

async fn market(words: &[String], client: &GeminiClient) -> Result<()> {
    let query = if words.is_empty() {
        DEFAULT_MARKET_QUERY.to_string()
    } else {
        words.join(" ")
    };

    let mut desk = MarketDesk::new();
    desk.run_query(client, &query).await;
    if let Some(notice) = desk.take_notice() {
        bail!(notice);
    }
    let Some(insight) = desk.insight() else {
        bail!("Query '{}' produced no insight", query);
    };

    println!("{}", insight.content);
    if !insight.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in insight.sources.iter().enumerate() {
            println!("  [{}] {} <{}>", i + 1, source.title, source.uri);
        }
    }
    Ok(())
}
