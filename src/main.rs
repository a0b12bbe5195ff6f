use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod sources;

use crate::audio::{channel::SongbirdConnector, registry::SubscriptionRegistry};
use crate::bot::SerenadeBot;
use crate::config::Config;
use crate::sources::{ytdlp, YtDlpFetcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serenade=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Serenade v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        ytdlp::verify_dependencies(&config.ytdlp_command).await?;
        println!("OK");
        return Ok(());
    }

    if let Err(e) = ytdlp::verify_dependencies(&config.ytdlp_command).await {
        error!("❌ yt-dlp no responde, las reproducciones fallarán: {:?}", e);
    }

    // Songbird compartido entre el cliente y el conector de voz
    let songbird = Songbird::serenity();
    let fetcher = Arc::new(YtDlpFetcher::new(
        config.ytdlp_command.clone(),
        config.ytdlp_format.clone(),
        config.first_byte_timeout,
    ));
    let connector = Arc::new(SongbirdConnector::new(songbird.clone()));
    let registry = Arc::new(SubscriptionRegistry::new(
        fetcher,
        connector,
        config.max_queue_size,
    ));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = SerenadeBot::new(config.clone(), registry.clone());

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shutdown_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown_registry.shutdown().await;
        std::process::exit(0);
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
