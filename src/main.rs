use std::io::Write as _;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use parley::ChatConfig;
use parley::error::log_error;
use parley::events::StreamEvent;
use parley::models::{ChatMode, ImageAttachment};
use parley::poll::StatusPoller;
use parley::session::{ChatSession, SubmitOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv::dotenv().ok();

    let config = ChatConfig::from_env();
    log::info!("🚀 Starting parley...");
    log::info!("📡 Backend: {}", config.base_url);
    log::info!("💬 Chat model: {}", config.chat_model);
    log::info!("⌨️  Generate model: {}", config.generate_model);
    log::info!("🖼️  Vision model: {}", config.vision_model);

    let session = ChatSession::new(config)?;
    session
        .transcript()
        .subscribe(|change| log::debug!("transcript changed: {:?}", change));

    // Background backend-status watcher; dropped (and thereby stopped)
    // when the REPL exits.
    let (status_tx, mut status_rx) = mpsc::channel(8);
    let status_api = session.api();
    let _status_watch = StatusPoller::spawn(Duration::from_secs(30), status_tx, move || {
        let api = status_api.clone();
        async move { api.running_models().await.ok() }
    });
    tokio::spawn(async move {
        while let Some(models) = status_rx.recv().await {
            log::debug!("backend has {} model(s) loaded", models.len());
        }
    });

    print_help();

    let mut mode = ChatMode::Chat;
    let mut model: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt(&mode, model.as_deref())?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command {
            ":quit" | ":q" => break,
            ":help" => print_help(),
            ":models" => match session.api().list_models().await {
                Ok(models) => {
                    for m in models {
                        println!("  {:<40} {:>12} bytes", m.name, m.size);
                    }
                }
                Err(err) => {
                    log_error(&err);
                    println!("✖ {}", err);
                }
            },
            ":status" => match session.api().running_models().await {
                Ok(models) if models.is_empty() => println!("  no models loaded"),
                Ok(models) => {
                    for m in models {
                        println!("  {} (expires {})", m.name, m.expires_at.as_deref().unwrap_or("?"));
                    }
                }
                Err(err) => println!("✖ {}", err),
            },
            ":model" if !rest.is_empty() => {
                model = Some(rest.to_string());
                println!("model set to {}", rest);
            }
            ":mode" => match rest.parse::<ChatMode>() {
                Ok(parsed) => mode = parsed,
                Err(_) => println!("unknown mode '{}'; use chat or generate", rest),
            },
            ":pull" if !rest.is_empty() => match session.pull_model(rest).await {
                Ok(rx) => consume_pull(rx).await,
                Err(err) => println!("✖ {}", err),
            },
            ":create" if !rest.is_empty() => {
                let (name, path) = match rest.split_once(char::is_whitespace) {
                    Some((name, path)) => (name, path.trim()),
                    None => {
                        println!("usage: :create <name> <modelfile-path>");
                        continue;
                    }
                };
                match tokio::fs::read_to_string(path).await {
                    Ok(modelfile) => match session.api().create_model(name, &modelfile).await {
                        Ok(message) => println!("{}", message),
                        Err(err) => println!("✖ {}", err),
                    },
                    Err(err) => println!("✖ cannot read {}: {}", path, err),
                }
            }
            ":comic" if !rest.is_empty() => match session.analyze_comic(rest).await {
                Ok(analysis) => {
                    println!("summary: {}", analysis.summary);
                    println!("scene:   {} ({:?}, {:?})", analysis.scene, analysis.setting, analysis.time_of_day);
                    for object in &analysis.objects {
                        println!("  - {} ({:.0}%): {}", object.name, object.confidence * 100.0, object.attributes);
                    }
                    if let Some(text) = &analysis.text_content {
                        println!("text:    {}", text);
                    }
                }
                Err(err) => println!("✖ {}", err),
            },
            ":image" if !rest.is_empty() => {
                let (path, message) = match rest.split_once(char::is_whitespace) {
                    Some((path, message)) => (path, message.trim()),
                    None => {
                        println!("usage: :image <path> <message>");
                        continue;
                    }
                };
                match ImageAttachment::from_path(path) {
                    Ok(image) => {
                        let opts = SubmitOptions {
                            model: model.clone(),
                            mode,
                            image: Some(image),
                            ..SubmitOptions::default()
                        };
                        match session.submit(message, opts) {
                            Ok(rx) => consume_exchange(rx).await,
                            Err(err) => println!("✖ {}", err),
                        }
                    }
                    Err(err) => println!("✖ {}", err),
                }
            }
            ":regen" => match session.regenerate() {
                Ok(rx) => consume_exchange(rx).await,
                Err(err) => println!("✖ {}", err),
            },
            _ if command.starts_with(':') => println!("unknown command {} (:help)", command),
            _ => {
                let opts = SubmitOptions {
                    model: model.clone(),
                    mode,
                    ..SubmitOptions::default()
                };
                match session.submit(line, opts) {
                    Ok(rx) => consume_exchange(rx).await,
                    Err(err) => println!("✖ {}", err),
                }
            }
        }
    }

    log::info!("👋 Bye");
    Ok(())
}

fn prompt(mode: &ChatMode, model: Option<&str>) -> std::io::Result<()> {
    print!("[{}{}] > ", mode, model.map(|m| format!(":{}", m)).unwrap_or_default());
    std::io::stdout().flush()
}

fn print_help() {
    println!("commands:");
    println!("  :models            list available models");
    println!("  :status            show loaded models");
    println!("  :model <name>      override the model for new messages");
    println!("  :mode chat|generate  switch submission mode");
    println!("  :image <path> <msg>  send an image with a message");
    println!("  :comic <path>      analyze a comic panel");
    println!("  :pull <name>       pull a model, with progress");
    println!("  :create <name> <modelfile>  create a model from a Modelfile");
    println!("  :regen             regenerate the last response");
    println!("  :quit              exit");
    println!("anything else is sent as a chat message");
}

/// Drain one exchange's event feed, printing fragments as they arrive.
async fn consume_exchange(mut rx: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextChunk { chunk, .. } => {
                print!("{}", chunk);
                let _ = std::io::stdout().flush();
            }
            StreamEvent::Completed { .. } => {
                println!();
                break;
            }
            StreamEvent::Error { error, .. } => {
                println!("\n✖ {}", error);
                break;
            }
            StreamEvent::Cancelled { reason, .. } => {
                println!("\n(cancelled: {})", reason);
                break;
            }
            _ => {}
        }
    }
}

async fn consume_pull(mut rx: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::PullProgress { status, completed, total, .. } => {
                match (completed, total) {
                    (Some(done), Some(total)) if total > 0 => {
                        print!("\r{}: {:.1}%", status, done as f64 * 100.0 / total as f64);
                    }
                    _ => print!("\r{}", status),
                }
                let _ = std::io::stdout().flush();
            }
            StreamEvent::Completed { final_result, .. } => {
                println!("\n{}", final_result);
                break;
            }
            StreamEvent::Error { error, .. } => {
                println!("\n✖ {}", error);
                break;
            }
            StreamEvent::Cancelled { reason, .. } => {
                println!("\n(cancelled: {})", reason);
                break;
            }
            _ => {}
        }
    }
}
