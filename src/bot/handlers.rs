use anyhow::Result;
use chrono::{DateTime, Utc};
use serenity::{
    model::{
        channel::Message,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{debug, error, info};
use url::{ParseError, Url};

use crate::{
    audio::{error::PlaybackError, queue::QueueSnapshot, subscription::Enqueued},
    bot::{
        commands::{self, Command},
        SerenadeBot,
    },
};

const QUEUE_PAGE: usize = 10;

/// Maneja mensajes con prefijo
pub async fn handle_message(ctx: &Context, msg: &Message, bot: &SerenadeBot) -> Result<()> {
    if msg.author.bot {
        return Ok(());
    }
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    let Some(command) = commands::parse(&bot.config.command_prefix, &msg.content) else {
        return Ok(());
    };

    match command {
        Command::Play(url) => handle_play(ctx, msg, bot, guild_id, url).await,
        Command::Stop => handle_stop(ctx, msg, bot, guild_id).await,
        Command::Skip => handle_skip(ctx, msg, bot, guild_id).await,
        Command::Queue => handle_queue(ctx, msg, bot, guild_id).await,
        Command::Unknown(name) => {
            debug!("Comando desconocido '{}' en guild {}", name, guild_id);
            Ok(())
        }
    }
}

async fn handle_play(
    ctx: &Context,
    msg: &Message,
    bot: &SerenadeBot,
    guild_id: GuildId,
    url: Option<&str>,
) -> Result<()> {
    let Some(url) = url else {
        msg.reply(ctx, "Por favor, proporciona una URL o ID de YouTube.").await?;
        return Ok(());
    };

    if let Err(reason) = validate_reference(url) {
        msg.reply(ctx, format!("❌ Referencia inválida: {reason}")).await?;
        return Ok(());
    }

    let Some(channel_id) = get_user_voice_channel(ctx, guild_id, msg.author.id) else {
        msg.reply(ctx, "¡Debes estar en un canal de voz!").await?;
        return Ok(());
    };

    info!(
        "📝 play {} por {} en guild {}",
        url, msg.author.name, guild_id
    );

    let reply = match bot.registry.play(guild_id, channel_id, url, msg.author.id).await {
        Ok(Enqueued::Started) => format!("Ahora transmitiendo: {url}"),
        Ok(Enqueued::Queued { position }) => format!("Agregado a la cola (#{position}): {url}"),
        Err(e) if e.is_user_visible() => {
            if !e.is_track_failure() {
                error!("Error en play para guild {}: {}", guild_id, e);
            }
            error_reply(&e)
        }
        Err(e) => {
            error!("Error interno en play para guild {}: {}", guild_id, e);
            return Ok(());
        }
    };

    msg.reply(ctx, reply).await?;
    Ok(())
}

async fn handle_stop(ctx: &Context, msg: &Message, bot: &SerenadeBot, guild_id: GuildId) -> Result<()> {
    let reply = match bot.registry.stop(guild_id).await {
        Ok(()) => "Reproducción detenida y desconectado.".to_string(),
        Err(PlaybackError::NothingPlaying) => {
            "¡No estoy reproduciendo nada en este servidor!".to_string()
        }
        Err(e) => error_reply(&e),
    };

    msg.reply(ctx, reply).await?;
    Ok(())
}

async fn handle_skip(ctx: &Context, msg: &Message, bot: &SerenadeBot, guild_id: GuildId) -> Result<()> {
    let reply = match bot.registry.skip(guild_id).await {
        Ok(()) => "Saltando la pista actual...".to_string(),
        Err(PlaybackError::NothingPlaying) => {
            "¡No se está reproduciendo nada en este momento!".to_string()
        }
        Err(e) => error_reply(&e),
    };

    msg.reply(ctx, reply).await?;
    Ok(())
}

async fn handle_queue(ctx: &Context, msg: &Message, bot: &SerenadeBot, guild_id: GuildId) -> Result<()> {
    let reply = match bot.registry.snapshot(guild_id).await {
        Some(snapshot) => format_queue(&snapshot, Utc::now()),
        None => "¡No se está reproduciendo nada en este momento!".to_string(),
    };

    msg.reply(ctx, reply).await?;
    Ok(())
}

// Funciones auxiliares

/// Accepts http(s) URLs and bare identifiers such as a video ID.
///
/// Anything with a scheme must be http(s); yt-dlp receives the reference
/// after `--`, so an identifier is never read as an option.
fn validate_reference(raw: &str) -> Result<(), &'static str> {
    match Url::parse(raw) {
        Ok(url) => match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(()),
            "http" | "https" => Err("falta el host"),
            _ => Err("solo se aceptan enlaces http(s)"),
        },
        Err(ParseError::RelativeUrlWithoutBase) => Ok(()),
        Err(_) => Err("no es una URL válida"),
    }
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

fn error_reply(err: &PlaybackError) -> String {
    match err {
        PlaybackError::SourceUnavailable { reference, .. } => {
            format!("❌ No se pudo reproducir {reference}")
        }
        PlaybackError::FirstByteTimeout { reference, timeout } => format!(
            "⏱️ {reference} no respondió en {}",
            humantime::format_duration(*timeout)
        ),
        PlaybackError::QueueFull(max) => format!("📋 La cola está llena (máximo {max} pistas)"),
        PlaybackError::Connect(_) => "❌ No pude unirme al canal de voz".to_string(),
        PlaybackError::NothingPlaying => "¡No se está reproduciendo nada en este momento!".to_string(),
        _ => "❌ Error de reproducción, intenta de nuevo".to_string(),
    }
}

fn format_queue(snapshot: &QueueSnapshot, now: DateTime<Utc>) -> String {
    let mut lines = Vec::new();

    match &snapshot.now_playing {
        Some(entry) => lines.push(format!("🎵 Sonando: {} (pedido por <@{}>)", entry.reference, entry.requested_by)),
        None => lines.push("🎵 Sonando: nada".to_string()),
    }

    let (shown, hidden) = snapshot.head(QUEUE_PAGE);
    if shown.is_empty() {
        lines.push("📭 La cola está vacía".to_string());
    }
    for (index, entry) in shown.iter().enumerate() {
        let waited = (now - entry.added_at).to_std().unwrap_or(Duration::ZERO);
        // segundos completos, sin milisegundos
        let waited = Duration::from_secs(waited.as_secs());
        lines.push(format!(
            "{}. {} (pedido por <@{}>, hace {})",
            index + 1,
            entry.reference,
            entry.requested_by,
            humantime::format_duration(waited)
        ));
    }
    if hidden > 0 {
        lines.push(format!("... y {hidden} más"));
    }

    lines.join("\n")
}
