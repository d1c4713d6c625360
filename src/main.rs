use std::error::Error;
use std::io::Write;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use parley::auth::{KeyBag, Provider, Route, SystemKeyVault};
use parley::core::chat_stream::{ChatStreamService, StreamEvent};
use parley::core::classify::CancelReason;
use parley::core::config::Config;
use parley::core::panel::ChatPanel;
use parley::core::persistence::{DebouncedSaver, PanelStorage};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "A line-mode streaming chat client for AI APIs")]
#[command(long_about = "Parley streams chat responses from OpenAI, Anthropic, Gemini, or a \
local Ollama instance.\n\n\
Commands while chatting:\n\
  /cancel           Stop the current generation\n\
  /retry            Re-send the last message\n\
  /clear            Empty the transcript and draft\n\
  /quit             Exit")]
struct Args {
    /// Provider to chat with (openai, anthropic, gemini, ollama)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (defaults to the provider's stock model)
    #[arg(short, long)]
    model: Option<String>,

    /// Start with an empty transcript instead of restoring history
    #[arg(long)]
    fresh: bool,
}

fn resolve_route(args: &Args, config: &Config) -> Result<Route, Box<dyn Error>> {
    let route = match &args.provider {
        Some(id) => {
            let provider = Provider::from_id(id)
                .ok_or_else(|| format!("Unknown provider '{id}'. Known providers: openai, anthropic, gemini, ollama"))?;
            Route::new(provider, config.model_for(provider))
        }
        None => config.default_route(),
    };
    Ok(match &args.model {
        Some(model) => Route::new(route.provider, model.clone()),
        None => route,
    })
}

fn build_key_bag(config: &Config) -> KeyBag {
    let mut keys = KeyBag::new().with_vault(Box::new(SystemKeyVault));
    for (id, key) in &config.provider_keys {
        if let Some(provider) = Provider::from_id(id) {
            keys.set_profile_key(provider, key.clone());
        }
    }
    // Environment variables act as runtime-injected keys and win over
    // everything stored.
    for (provider, var) in [
        (Provider::OpenAi, "OPENAI_API_KEY"),
        (Provider::Anthropic, "ANTHROPIC_API_KEY"),
        (Provider::Gemini, "GEMINI_API_KEY"),
    ] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                keys.set_runtime_key(provider, key);
            }
        }
    }
    keys
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load()?;
    let route = resolve_route(&args, &config)?;
    let keys = build_key_bag(&config);

    let storage = PanelStorage::new()?;
    let saver = DebouncedSaver::spawn(storage.clone());
    let (transport, mut events) = ChatStreamService::new();

    let mut panel = ChatPanel::new(config, keys, Box::new(transport)).with_saver(saver);
    if !args.fresh {
        if let Some(history) = storage.load_history() {
            panel.restore_history(history);
        }
    }
    if let Some(draft) = storage.load_draft() {
        if !draft.is_empty() {
            println!("(restored draft: {draft})");
        }
    }

    println!(
        "Chatting with {} ({}). /quit to exit.",
        route.provider.display_name(),
        route.model
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_prompt()?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/cancel" => panel.cancel(CancelReason::USER_ABORT_DETAIL),
                    "/clear" => {
                        panel.clear_all();
                        println!("(transcript cleared)");
                    }
                    "/retry" => match panel.retry_last(route.clone()) {
                        Ok(_) => {}
                        Err(e) => println!("{e}"),
                    },
                    text => {
                        panel.update_draft(text);
                        if let Err(e) = panel.submit(text, route.clone()) {
                            println!("{e}");
                        }
                    }
                }
                if panel.can_send() {
                    print_prompt()?;
                }
            }
            event = events.recv() => {
                let Some((event, rid)) = event else { break };
                let done = matches!(
                    event,
                    StreamEvent::Completed { .. } | StreamEvent::Errored(_)
                );
                let chunk = match &event {
                    StreamEvent::Delta(chunk) => Some(chunk.clone()),
                    _ => None,
                };
                // Stale events (a cancelled stream's leftovers) must not
                // echo either; print only what the panel applied.
                if panel.handle_event(event, rid) {
                    if let Some(chunk) = chunk {
                        print!("{chunk}");
                        std::io::stdout().flush()?;
                    }
                    if done {
                        if let Some(failure) = panel.last_failure() {
                            println!("\n{failure}");
                        } else {
                            println!();
                        }
                        print_prompt()?;
                    }
                }
            }
        }
    }

    panel.cancel("closed_flag");
    Ok(())
}

fn print_prompt() -> Result<(), Box<dyn Error>> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}
