//! SweatBet Server
//!
//! Runs the HTTP/WebSocket server, plus admin commands against the escrow:
//! create a bet, build an authorize link, resolve handles, read status, claim.

use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sweatbet::{
    core::config::AppConfig,
    core::time::{days_after, to_rfc3339, unix_now},
    core::units::{format_token_amount, parse_token_amount},
    network::{
        escrow::NewWager,
        identity::{parse_handle_list, resolve_usernames, user_by_address, NeynarClient},
        oauth::{authorize_url, HandoffState},
        protocol::{share_url, WagerView},
        server::{AppContext, ServerConfig, WagerServer},
    },
    wager::state::{Participant, WagerId},
    VERSION,
};

const DEFAULT_LOG_LEVEL: &str = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };

#[derive(Parser, Debug)]
#[clap(author, version, about = "SweatBet wager server")]
struct Cli {
    /// Used when RUST_LOG is not set.
    #[clap(long, default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP and WebSocket server.
    Serve,

    /// Create a bet on the escrow and print its share link.
    CreateBet {
        /// Stake per participant in cUSD.
        #[clap(long, default_value = "10")]
        amount: String,

        /// Target distance in meters.
        #[clap(long, default_value = "5000")]
        target: u64,

        /// Days until the deadline.
        #[clap(long, default_value = "7")]
        days: u64,

        /// Activity type.
        #[clap(long, default_value = "Run")]
        activity_type: String,

        /// Comma-separated Farcaster handles to invite.
        #[clap(long)]
        usernames: Option<String>,

        /// Creating account (defaults to SENDER_ADDRESS).
        #[clap(long)]
        from: Option<Address>,

        /// Neynar signer to announce the bet with.
        #[clap(long)]
        signer_uuid: Option<String>,
    },

    /// Print the Strava authorize link for a participant of a bet.
    AuthUrl {
        #[clap(long)]
        bet_id: u64,

        /// Account the proof will be submitted for.
        #[clap(long)]
        address: Address,
    },

    /// Resolve Farcaster handles to addresses.
    Resolve {
        #[clap(long)]
        usernames: String,
    },

    /// Show a bet, and optionally one participant's state.
    Status {
        #[clap(long)]
        bet_id: u64,

        #[clap(long)]
        address: Option<Address>,
    },

    /// Claim winnings for a settled bet.
    Claim {
        #[clap(long)]
        bet_id: u64,

        /// Claiming account (defaults to SENDER_ADDRESS).
        #[clap(long)]
        from: Option<Address>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let config = AppConfig::from_env()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::CreateBet {
            amount,
            target,
            days,
            activity_type,
            usernames,
            from,
            signer_uuid,
        } => {
            let handles = parse_handle_list(usernames.as_deref().unwrap_or_default());
            let request = BetRequest {
                amount,
                target,
                days,
                activity_type,
                handles,
                from,
                signer_uuid,
            };
            create_bet(config, request).await
        }
        Command::AuthUrl { bet_id, address } => {
            let handoff = HandoffState::new(WagerId(bet_id), address);
            let url = authorize_url(&config.strava, &config.app_url, &handoff)?;
            println!("{}", url);
            Ok(())
        }
        Command::Resolve { usernames } => resolve(config, &usernames).await,
        Command::Status { bet_id, address } => status(config, WagerId(bet_id), address).await,
        Command::Claim { bet_id, from } => claim(config, WagerId(bet_id), from).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("SweatBet Server v{}", VERSION);
    info!("Chain: {:?} ({})", config.chain.chain, config.chain.chain.id());

    let missing = config.missing_keys();
    if !missing.is_empty() {
        warn!("Missing configuration, some routes will fail: {}", missing.join(", "));
    }

    let server_config = ServerConfig::from_env()?;
    let ctx = Arc::new(AppContext::from_config(config));
    let server = Arc::new(WagerServer::new(server_config, ctx));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}

struct BetRequest {
    amount: String,
    target: u64,
    days: u64,
    activity_type: String,
    handles: Vec<String>,
    from: Option<Address>,
    signer_uuid: Option<String>,
}

async fn create_bet(config: AppConfig, request: BetRequest) -> Result<()> {
    let from = sender(&config, request.from)?;
    let amount = parse_token_amount(&request.amount)?;
    if request.target == 0 || request.days == 0 {
        bail!("--target and --days must be positive");
    }

    let ctx = AppContext::from_config(config);
    let chain = ctx.config.chain.chain;

    if !request.handles.is_empty() {
        match resolve_usernames(ctx.identity.as_ref(), &request.handles).await {
            Ok(resolved) => {
                for p in resolved {
                    info!("Invitee @{} -> {}", p.handle, p.address);
                }
            }
            Err(e) => warn!("Could not resolve invitees: {}", e),
        }
    }

    let wager = NewWager {
        amount,
        target_distance_m: request.target,
        deadline: days_after(unix_now(), request.days),
        activity_type: request.activity_type,
    };

    info!("Creating bet on {:?}", chain);
    info!("- Amount: {} cUSD", format_token_amount(wager.amount));
    info!("- Target: {:.1} km", wager.target_distance_m as f64 / 1000.0);
    info!("- Deadline: {}", to_rfc3339(wager.deadline));
    info!("- Type: {}", wager.activity_type);

    let created = ctx.wagers.create_wager(from, &wager).await?;
    let link = share_url(&ctx.config.app_url, &request.handles, created.id);

    println!("Bet ID: {}", created.id);
    println!("Transaction: {}", chain.explorer_tx_url(&created.tx.to_string()));
    println!("Share this URL on Farcaster:");
    println!("{}", link);

    if let Some(signer) = request.signer_uuid {
        let mentions: Vec<String> = request.handles.iter().map(|h| format!("@{}", h)).collect();
        let text = format!(
            "New SweatBet: {} {:.1} km by {} for {} cUSD. {}",
            wager.activity_type,
            wager.target_distance_m as f64 / 1000.0,
            to_rfc3339(wager.deadline),
            format_token_amount(wager.amount),
            mentions.join(" ")
        );
        let neynar = NeynarClient::new(ctx.config.neynar.clone());
        let cast = neynar.publish_cast(&signer, text.trim_end(), &[link]).await?;
        println!("Announced in cast {}", cast.hash);
    }
    Ok(())
}

async fn resolve(config: AppConfig, usernames: &str) -> Result<()> {
    let handles = parse_handle_list(usernames);
    if handles.is_empty() {
        bail!("no handles given");
    }
    let ctx = AppContext::from_config(config);
    let resolved = resolve_usernames(ctx.identity.as_ref(), &handles).await?;
    for p in &resolved {
        println!("@{}\tfid {}\t{}", p.handle, p.fid, p.address);
    }
    if resolved.len() < handles.len() {
        warn!("{} of {} handles did not resolve", handles.len() - resolved.len(), handles.len());
    }
    Ok(())
}

async fn status(config: AppConfig, id: WagerId, address: Option<Address>) -> Result<()> {
    let ctx = AppContext::from_config(config);
    let wager = ctx.wagers.wager_details(id).await?;
    println!("{}", serde_json::to_string_pretty(&WagerView::new(&wager, unix_now()))?);

    if let Some(address) = address {
        let has_proof = ctx.wagers.has_proof(id, address).await?;
        let handle = user_by_address(ctx.identity.as_ref(), address).await.map(|u| u.username);
        let participant = Participant::from_chain(address, handle, &wager, has_proof);
        println!(
            "{} ({}): {}",
            participant.address,
            participant.handle.as_deref().unwrap_or("unknown"),
            participant.state.name()
        );
    }
    Ok(())
}

async fn claim(config: AppConfig, id: WagerId, from: Option<Address>) -> Result<()> {
    let from = sender(&config, from)?;
    let ctx = AppContext::from_config(config);
    let tx = ctx.wagers.claim_winnings(from, id).await?;
    println!("Claimed: {}", ctx.explorer_url(&tx));
    Ok(())
}

fn sender(config: &AppConfig, from: Option<Address>) -> Result<Address> {
    from.or(config.chain.sender)
        .context("no sending account: pass --from or set SENDER_ADDRESS")
}
