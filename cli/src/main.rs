use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use frames::SignalMessage;
use helpdesk::access;
use helpdesk::config::{ClientConfig, ConfigError, DEFAULT_BASE_URL, ReconnectPolicy};
use helpdesk::net::api::{ApiClient, ApiError, NotificationQuery};
use helpdesk::net::channel::CallChannel;
use helpdesk::net::connection::ConnectionManager;
use helpdesk::net::driver::{self, Wake};
use helpdesk::net::types::{NewTicket, NewTransfer, TicketStatus};
use helpdesk::net::ws_transport::TungsteniteTransport;
use helpdesk::notice::NoticeSink;
use helpdesk::session::ChatSession;
use helpdesk::state::chat::{ChatMessage, Delivery, MessageId, Sender};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing token; pass --token or set HELPDESK_TOKEN")]
    MissingToken,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    Unhealthy(u16),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket transport stopped")]
    TransportGone,
}

#[derive(Parser, Debug)]
#[command(name = "helpdesk-cli", about = "Helpdesk API, ticket chat and call signaling CLI")]
struct Cli {
    #[arg(long, env = "HELPDESK_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "HELPDESK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    config: ClientConfig,
    token: Option<String>,
}

impl CliContext {
    fn token(&self) -> Result<&str, CliError> {
        self.token.as_deref().ok_or(CliError::MissingToken)
    }

    fn api(&self) -> Result<ApiClient, CliError> {
        Ok(ApiClient::with_token(&self.config.base_url, self.token()?)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    /// Exchange credentials for a bearer token.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "HELPDESK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Api(ApiCommand),
    /// Interactive chat on a ticket's message room.
    Chat { ticket_id: u64 },
    Call(CallCommand),
}

#[derive(Args, Debug)]
struct ApiCommand {
    #[command(subcommand)]
    command: ApiSubcommand,
}

#[derive(Subcommand, Debug)]
enum ApiSubcommand {
    #[command(subcommand)]
    Ticket(TicketSubcommand),
    #[command(subcommand)]
    Message(MessageSubcommand),
    #[command(subcommand)]
    User(ListSubcommand),
    #[command(subcommand)]
    Category(ListSubcommand),
    #[command(subcommand)]
    Transfer(TransferSubcommand),
    #[command(subcommand)]
    Notification(NotificationSubcommand),
}

#[derive(Subcommand, Debug)]
enum ListSubcommand {
    List,
}

#[derive(Subcommand, Debug)]
enum TicketSubcommand {
    List,
    Mine,
    Read {
        ticket_id: u64,
    },
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        category_id: i64,
        #[arg(long)]
        subcategory_id: Option<i64>,
    },
    Status {
        ticket_id: u64,
        /// e.g. `in_progress`, `resolved`, `closed`.
        status: String,
    },
    Reopen {
        ticket_id: u64,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum MessageSubcommand {
    List { ticket_id: u64 },
    Post { ticket_id: u64, content: String },
    Delete { message_id: i64 },
}

#[derive(Subcommand, Debug)]
enum TransferSubcommand {
    List,
    Request {
        ticket_id: u64,
        #[arg(long)]
        to_agent_id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    Approve {
        transfer_id: i64,
    },
    Reject {
        transfer_id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum NotificationSubcommand {
    List {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = false)]
        unread_only: bool,
    },
    Stats,
    Read {
        notification_id: i64,
    },
    ReadAll,
}

#[derive(Args, Debug)]
struct CallCommand {
    #[command(subcommand)]
    command: CallSubcommand,
}

#[derive(Subcommand, Debug)]
enum CallSubcommand {
    /// Print every signaling frame relayed on a ticket.
    Watch {
        ticket_id: u64,
        /// Answer incoming offers with `call-rejected`.
        #[arg(long, default_value_t = false)]
        reject: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = CliContext {
        config: ClientConfig::new(&cli.base_url)?.with_reconnect(ReconnectPolicy::from_env()),
        token: cli.token,
    };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Login { username, password } => run_login(&ctx, &username, &password).await,
        Command::Api(api) => run_api(&ctx, api).await,
        Command::Chat { ticket_id } => run_chat(&ctx, ticket_id).await,
        Command::Call(call) => match call.command {
            CallSubcommand::Watch { ticket_id, reject } => run_call_watch(&ctx, ticket_id, reject).await,
        },
    }
}

async fn run_ping(ctx: &CliContext) -> Result<(), CliError> {
    let url = format!("{}/", ctx.config.base_url);
    let status = reqwest::Client::new().get(url).send().await?.status();
    if !status.is_success() {
        return Err(CliError::Unhealthy(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

async fn run_login(ctx: &CliContext, username: &str, password: &str) -> Result<(), CliError> {
    let response = ApiClient::new(&ctx.config.base_url)?.login(username, password).await?;
    print_json(&json!({
        "access_token": response.access_token,
        "token_type": response.token_type,
        "role": response.role,
    }))
}

// =============================================================================
// REST
// =============================================================================

async fn run_api(ctx: &CliContext, api: ApiCommand) -> Result<(), CliError> {
    let client = ctx.api()?;
    match api.command {
        ApiSubcommand::Ticket(command) => run_api_ticket(&client, command).await,
        ApiSubcommand::Message(command) => match command {
            MessageSubcommand::List { ticket_id } => print_json(&client.messages(ticket_id).await?),
            MessageSubcommand::Post { ticket_id, content } => {
                print_json(&client.post_message(ticket_id, &content).await?)
            }
            MessageSubcommand::Delete { message_id } => print_json(&client.delete_message(message_id).await?),
        },
        ApiSubcommand::User(ListSubcommand::List) => print_json(&client.users().await?),
        ApiSubcommand::Category(ListSubcommand::List) => print_json(&client.categories().await?),
        ApiSubcommand::Transfer(command) => match command {
            TransferSubcommand::List => print_json(&client.transfers().await?),
            TransferSubcommand::Request { ticket_id, to_agent_id, reason } => {
                let transfer = NewTransfer { to_agent_id, reason };
                print_json(&client.request_transfer(ticket_id, &transfer).await?)
            }
            TransferSubcommand::Approve { transfer_id } => print_json(&client.resolve_transfer(transfer_id, true).await?),
            TransferSubcommand::Reject { transfer_id } => print_json(&client.resolve_transfer(transfer_id, false).await?),
        },
        ApiSubcommand::Notification(command) => match command {
            NotificationSubcommand::List { skip, limit, unread_only } => {
                let query = NotificationQuery { skip, limit, unread_only };
                print_json(&client.notifications(query).await?)
            }
            NotificationSubcommand::Stats => print_json(&client.notification_stats().await?),
            NotificationSubcommand::Read { notification_id } => {
                print_json(&client.mark_notification_read(notification_id).await?)
            }
            NotificationSubcommand::ReadAll => print_json(&client.mark_all_notifications_read().await?),
        },
    }
}

async fn run_api_ticket(client: &ApiClient, command: TicketSubcommand) -> Result<(), CliError> {
    match command {
        TicketSubcommand::List => print_json(&client.tickets().await?),
        TicketSubcommand::Mine => print_json(&client.my_tickets().await?),
        TicketSubcommand::Read { ticket_id } => print_json(&client.ticket(ticket_id).await?),
        TicketSubcommand::Create { title, description, category_id, subcategory_id } => {
            let ticket = NewTicket { title, initial_description: description, category_id, subcategory_id };
            print_json(&client.create_ticket(&ticket).await?)
        }
        TicketSubcommand::Status { ticket_id, status } => {
            let status = serde_json::from_value::<TicketStatus>(Value::String(status))?;
            print_json(&client.update_ticket_status(ticket_id, status).await?)
        }
        TicketSubcommand::Reopen { ticket_id, reason } => print_json(&client.request_reopen(ticket_id, &reason).await?),
    }
}

// =============================================================================
// CHAT
// =============================================================================

async fn run_chat(ctx: &CliContext, ticket_id: u64) -> Result<(), CliError> {
    let token = ctx.token()?;
    let api = ctx.api()?;
    let user = api.me().await?;
    let ticket = api.ticket(ticket_id).await?;

    if !access::can_access_messages(&user, &ticket) {
        eprintln!("no live room for ticket {ticket_id}; showing history");
        for record in api.messages(ticket_id).await? {
            print_message(&ChatMessage::from(record));
        }
        return Ok(());
    }

    let me = Sender { id: user.id, name: user.name.clone(), role: Some(user.role) };
    let (transport, mut events) = TungsteniteTransport::new();
    let (notices, mut notice_rx) = NoticeSink::channel();
    let mut session = ChatSession::new(
        &ctx.config,
        ticket_id,
        token,
        me,
        access::predicate(user, ticket),
        api,
        transport,
        notices,
    )?;

    session.load_initial().await;
    print_history(&session);
    let _printer = session.add_listener(print_message);
    session.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/refresh" => {
                        session.refresh().await;
                        print_history(&session);
                    }
                    "/retry" => retry_failed(&mut session).await,
                    content => {
                        if let Err(error) = session.send(content).await {
                            eprintln!("not sent, draft kept: {error}");
                        }
                    }
                }
            }
            wake = driver::wait(&mut events, session.reconnect_deadline()) => match wake {
                Some(Wake::Event(event)) => session.handle_event(event),
                Some(Wake::Tick) => session.tick_at(Instant::now()),
                None => return Err(CliError::TransportGone),
            },
            Some(notice) = notice_rx.recv() => eprintln!("* {notice}"),
        }
    }

    session.disconnect();
    Ok(())
}

async fn retry_failed(session: &mut ChatSession<ApiClient, TungsteniteTransport>) {
    let failed: Vec<MessageId> = session
        .store()
        .messages()
        .iter()
        .filter(|m| m.delivery == Delivery::Failed)
        .map(|m| m.id.clone())
        .collect();
    if failed.is_empty() {
        eprintln!("nothing to retry");
    }
    for id in failed {
        if let Err(error) = session.retry(&id).await {
            eprintln!("retry of {id} failed: {error}");
        }
    }
}

fn print_history(session: &ChatSession<ApiClient, TungsteniteTransport>) {
    for message in session.store().messages() {
        print_message(message);
    }
}

fn print_message(message: &ChatMessage) {
    let flag = match message.delivery {
        Delivery::Confirmed => "",
        Delivery::Pending => " (sending)",
        Delivery::Failed => " (failed)",
    };
    println!("[{}] {}{flag}", message.sender.name, message.content);
}

// =============================================================================
// CALL SIGNALING
// =============================================================================

async fn run_call_watch(ctx: &CliContext, ticket_id: u64, reject: bool) -> Result<(), CliError> {
    let (transport, mut events) = TungsteniteTransport::new();
    let (notices, mut notice_rx) = NoticeSink::channel();
    let mut channel = ConnectionManager::new(
        CallChannel::new(ctx.config.ws_base()?),
        transport,
        Some(ticket_id),
        Some(ctx.token()?.to_owned()),
        || true,
        ctx.config.reconnect,
        notices,
    );

    let offers = Rc::new(RefCell::new(Vec::new()));
    let queue = Rc::clone(&offers);
    let _printer = channel.add_listener(move |frame: &SignalMessage| {
        match frames::encode(frame) {
            Ok(text) => println!("{text}"),
            Err(error) => tracing::warn!(%error, "unprintable signaling frame"),
        }
        if let SignalMessage::Offer { ticket_id: offered, .. } = frame {
            queue.borrow_mut().push(offered.unwrap_or(ticket_id));
        }
    });
    channel.connect();

    loop {
        tokio::select! {
            wake = driver::wait(&mut events, channel.reconnect_deadline()) => match wake {
                Some(Wake::Event(event)) => channel.handle_event(event),
                Some(Wake::Tick) => channel.tick_at(Instant::now()),
                None => return Err(CliError::TransportGone),
            },
            Some(notice) = notice_rx.recv() => eprintln!("* {notice}"),
            _ = tokio::signal::ctrl_c() => break,
        }

        let pending: Vec<u64> = offers.borrow_mut().drain(..).collect();
        if reject {
            for offered in pending {
                let sent = channel.send(&SignalMessage::CallRejected { ticket_id: Some(offered) });
                tracing::info!(ticket_id = offered, sent, "rejected incoming call");
            }
        }
    }

    channel.disconnect();
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
