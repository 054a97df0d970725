/// Interactive terminal client
use crate::chat_types::{ConversationId, ImageRef, Message, MessageContent};
use crate::config::Config;
use crate::context::{ChatContext, Services};
use crate::credential::{CredentialStore, MemoryCredentialStore, SledCredentialStore};
use crate::history::{HistoryEvent, HistoryManager};
use crate::local_backend::LocalBackend;
use crate::nav_stack::NavigationAction;
use crate::rest_client::RestClient;
use bytes::Bytes;
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::error;

type Input = Lines<BufReader<Stdin>>;

pub async fn run(mut config: Config) -> anyhow::Result<()> {
    let services = if config.offline {
        let backend = Arc::new(LocalBackend::with_demo_data());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        config.transport_addr = listener.local_addr()?.to_string();
        let server = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("Local transport stopped: {}", e);
            }
        });
        println!(
            "{} Offline mode, demo accounts: {}",
            "ℹ".cyan(),
            "admin/admin user/user guest/guest".yellow()
        );
        Services::from_backend(backend, Arc::new(MemoryCredentialStore::new()))
    } else {
        std::fs::create_dir_all(&config.data_dir)?;
        let store: Arc<dyn CredentialStore> = Arc::new(SledCredentialStore::new(&config.data_dir)?);
        let client = Arc::new(RestClient::new(&config.api_url, store.clone())?);
        Services::from_backend(client, store)
    };

    let ctx = Arc::new(ChatContext::new(config, services));
    ctx.start().await;

    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();
    if !ctx.session().is_authenticated() {
        login_interactive(&ctx, &mut input).await?;
    }

    let history = ctx.history();
    spawn_printers(&ctx, &history);
    push_menu(&ctx);
    print_help();

    while let Some(line) = input.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle_line(&ctx, &history, line).await {
            break;
        }
    }

    ctx.shutdown().await;
    Ok(())
}

/// Returns false when the client should exit
async fn handle_line(ctx: &Arc<ChatContext>, history: &Arc<HistoryManager>, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match command {
        "/quit" | "/exit" => return false,
        "/help" => print_help(),
        "/login" => match args.as_slice() {
            [user, password] => {
                if ctx.session().authenticate(user, password).await {
                    println!("{} Logged in as {}", "✓".green().bold(), user.cyan());
                } else {
                    eprintln!("{} Login failed", "✗".red().bold());
                }
            }
            _ => eprintln!("{}", "Usage: /login <user> <password>".yellow()),
        },
        "/logout" => {
            history.close();
            ctx.active_view().set_viewing(None);
            ctx.session().sign_out().await;
            println!("{} Signed out", "✓".green().bold());
        }
        "/open" => match args.first().and_then(|id| id.parse::<i64>().ok()) {
            Some(id) => open_conversation(ctx, history, ConversationId(id)).await,
            None => eprintln!("{}", "Usage: /open <conversation id>".yellow()),
        },
        "/older" => match history.load_older_page().await {
            Ok(load) if load.reached_start && load.appended.is_empty() => {
                println!("{}", "── start of conversation ──".dimmed());
            }
            Ok(load) => {
                for message in &load.appended {
                    print_message(history, message);
                }
            }
            Err(e) => eprintln!("{} Could not load older messages: {}", "✗".red().bold(), e),
        },
        "/image" => match args.as_slice() {
            [resource, width, height] => match (width.parse(), height.parse()) {
                (Ok(width), Ok(height)) => {
                    let image = ImageRef {
                        resource_id: resource.to_string(),
                        width,
                        height,
                    };
                    send(ctx, history, MessageContent::Image(image)).await;
                }
                _ => eprintln!("{}", "Width and height must be numbers".yellow()),
            },
            _ => eprintln!("{}", "Usage: /image <resource id> <width> <height>".yellow()),
        },
        "/upload" => match args.as_slice() {
            [path, width, height] => upload(ctx, history, path, width, height).await,
            _ => eprintln!("{}", "Usage: /upload <file> <width> <height>".yellow()),
        },
        "/back" => match ctx.navigation().run_next() {
            Some(task) => {
                let _ = task.await;
                if ctx.navigation().len() > 1 {
                    ctx.navigation().pop();
                }
            }
            None => println!("{}", "Nothing to go back to".dimmed()),
        },
        _ if command.starts_with('/') => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
        }
        _ => send(ctx, history, MessageContent::Text(line.to_string())).await,
    }
    true
}

async fn login_interactive(ctx: &ChatContext, input: &mut Input) -> anyhow::Result<()> {
    let mut username = ctx.config().username.clone();
    let mut password = ctx.config().password.clone();
    loop {
        let user = match username.take() {
            Some(user) => user,
            None => match prompt(input, "Username: ").await? {
                Some(user) => user,
                None => anyhow::bail!("input closed before login"),
            },
        };
        let pass = match password.take() {
            Some(pass) => pass,
            None => match prompt(input, "Password: ").await? {
                Some(pass) => pass,
                None => anyhow::bail!("input closed before login"),
            },
        };

        if ctx.session().authenticate(&user, &pass).await {
            println!("{} Logged in as {}", "✓".green().bold(), user.cyan());
            return Ok(());
        }
        eprintln!("{} Invalid username or password", "✗".red().bold());
    }
}

async fn prompt(input: &mut Input, label: &str) -> anyhow::Result<Option<String>> {
    use std::io::Write;
    print!("{}", label.bright_white());
    std::io::stdout().flush()?;
    Ok(input.next_line().await?.map(|line| line.trim().to_string()))
}

async fn open_conversation(ctx: &Arc<ChatContext>, history: &Arc<HistoryManager>, id: ConversationId) {
    // Mark as viewed first so messages arriving during the load do not notify
    ctx.active_view().set_viewing(Some(id));
    if let Err(e) = history.open(id).await {
        ctx.active_view().set_viewing(None);
        eprintln!("{} Could not open conversation {}: {}", "✗".red().bold(), id, e);
        return;
    }

    if let Some(conversation) = history.conversation() {
        let kind = if conversation.is_group() { "group" } else { "direct" };
        println!(
            "{} {} ({}, {} members)",
            "──".dimmed(),
            conversation.title.bright_cyan().bold(),
            kind,
            conversation.member_ids.len()
        );
    }
    for message in history.messages() {
        print_message(history, &message);
    }

    if ctx.navigation().len() < 2 {
        let history = history.clone();
        let view = ctx.active_view().clone();
        ctx.navigation().push(NavigationAction::new("arrow_back", move || {
            history.close();
            view.set_viewing(None);
            println!("{}", "── left conversation ──".dimmed());
            let (done, completion) = oneshot::channel();
            let _ = done.send(());
            completion
        }));
    }
}

async fn send(ctx: &ChatContext, history: &HistoryManager, content: MessageContent) {
    let Some(conversation) = history.conversation() else {
        eprintln!("{}", "Open a conversation first: /open <id>".yellow());
        return;
    };
    if let Err(e) = ctx.send(conversation.id, content).await {
        eprintln!("{} Send failed: {}", "✗".red().bold(), e);
    }
}

async fn upload(ctx: &ChatContext, history: &HistoryManager, path: &str, width: &str, height: &str) {
    let (Ok(width), Ok(height)) = (width.parse(), height.parse()) else {
        eprintln!("{}", "Width and height must be numbers".yellow());
        return;
    };
    let data = match tokio::fs::read(path).await {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            eprintln!("{} Cannot read {}: {}", "✗".red().bold(), path, e);
            return;
        }
    };
    let file_name = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    match ctx.media().upload_image(data, file_name, width, height).await {
        Ok(image) => send(ctx, history, MessageContent::Image(image)).await,
        Err(e) => eprintln!("{} Upload failed: {}", "✗".red().bold(), e),
    }
}

fn push_menu(ctx: &ChatContext) {
    ctx.navigation().push(NavigationAction::new("menu", || {
        print_help();
        let (done, completion) = oneshot::channel();
        let _ = done.send(());
        completion
    }));
}

fn spawn_printers(ctx: &Arc<ChatContext>, history: &Arc<HistoryManager>) {
    let mut notifications = ctx.router().notifications();
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            println!(
                "{} {}  {}",
                "🔔".yellow(),
                notification.text.bright_white(),
                format!("[{}: /open {}]", notification.action_label, notification.target()).dimmed()
            );
        }
    });

    let mut updates = history.updates();
    let history = Arc::downgrade(history);
    tokio::spawn(async move {
        while let Some(event) = updates.recv().await {
            let Some(history) = history.upgrade() else {
                break;
            };
            if let HistoryEvent::Appended(message) = event {
                print_message(&history, &message);
            }
        }
    });
}

fn print_message(history: &HistoryManager, message: &Message) {
    let time = message
        .timestamp
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let author = history
        .author(message.author_id)
        .map(|a| a.display_name)
        .unwrap_or_else(|| format!("user {}", message.author_id));
    let body = match &message.content {
        MessageContent::Text(text) => text.normal(),
        MessageContent::Image(image) => format!(
            "[image {} {}x{}]",
            image.resource_id, image.width, image.height
        )
        .magenta(),
    };
    println!("{} {}: {}", time.dimmed(), author.cyan().bold(), body);
}

fn print_help() {
    println!("{}", "⚡ ChatLink".bright_cyan().bold());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <id>                 Open a conversation", "/open".cyan());
    println!("  {}                      Load older messages", "/older".cyan());
    println!("  {} <res> <w> <h>       Send an image reference", "/image".cyan());
    println!("  {} <file> <w> <h>     Upload and send an image", "/upload".cyan());
    println!("  {}                       Leave the conversation", "/back".cyan());
    println!("  {} <user> <password>   Log in", "/login".cyan());
    println!("  {}                     Sign out", "/logout".cyan());
    println!("  {}                       Exit", "/quit".cyan());
    println!("  {}                       Send to the open conversation", "<text>".cyan());
}
