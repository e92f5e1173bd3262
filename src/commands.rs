use anyhow::{Context as _, Result};
use chrono::Utc;
use log::{error, info, warn};
use poise::serenity_prelude as serenity;
use poise::CreateReply;
use serenity::{
    ChannelId, ChannelType, CreateChannel, GuildId, Mentionable, PermissionOverwrite,
    PermissionOverwriteType, Permissions, RoleId,
};

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Settings;
use crate::store::{CheckinRecord, RoomRecord, Stores};
use crate::voice_rooms::VoiceRooms;

type Context<'a> = poise::Context<'a, Data, anyhow::Error>;

pub struct Data {
    pub settings: Settings,
    pub stores: Stores,
    pub voice: Arc<VoiceRooms>,
}

impl Data {
    pub async fn new(settings: Settings) -> Result<Self> {
        let stores = Stores::open(&settings.data_dir).await?;
        let voice = Arc::new(VoiceRooms::new(&settings)?);
        Ok(Self {
            settings,
            stores,
            voice,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum RoomAction {
    #[name = "create"]
    Create,
    #[name = "close"]
    Close,
}

const ROOM_NAME_LIMIT: usize = 20;

/// Keeps ASCII letters and digits, `-`, `_` and Hangul syllables.
pub fn sanitize_room_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || ('가'..='힣').contains(c))
        .take(ROOM_NAME_LIMIT)
        .collect()
}

/// Base name for a personal room, falling back to `room-<username>`.
pub fn room_base_name(requested: Option<&str>, username: &str) -> String {
    let safe = requested.map(sanitize_room_name).unwrap_or_default();
    if safe.is_empty() {
        format!("room-{}", username).to_lowercase()
    } else {
        safe
    }
}

/// First of `🔒-base`, `🔒-base-1`, `🔒-base-2`, ... not already in use.
pub fn unique_channel_name(base: &str, taken: &HashSet<String>) -> String {
    let mut name = format!("🔒-{}", base);
    let mut counter = 1;
    while taken.contains(&name) {
        name = format!("🔒-{}-{}", base, counter);
        counter += 1;
    }
    name
}

/// Notes as given; the default only applies when the option was left out.
pub fn checkin_notes(notes: Option<String>) -> String {
    notes.unwrap_or_else(|| "none".to_string())
}

fn http_status(why: &serenity::Error) -> Option<u16> {
    match why {
        serenity::Error::Http(http) => http.status_code().map(|status| status.as_u16()),
        _ => None,
    }
}

/// Discord answers 404 for a channel that is already deleted.
pub fn is_missing_status(status: Option<u16>) -> bool {
    status == Some(404)
}

async fn reply_ephemeral(ctx: Context<'_>, content: impl Into<String>) -> Result<()> {
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

fn role_by_name(ctx: Context<'_>, name: &str) -> Option<RoleId> {
    ctx.guild()
        .and_then(|guild| guild.role_by_name(name).map(|role| role.id))
}

fn category_by_name(ctx: Context<'_>, name: &str) -> Option<ChannelId> {
    ctx.guild().and_then(|guild| {
        guild
            .channels
            .values()
            .find(|c| c.kind == ChannelType::Category && c.name == name)
            .map(|c| c.id)
    })
}

/// Check in and receive the guest role
#[poise::command(slash_command, guild_only)]
pub async fn checkin(
    ctx: Context<'_>,
    #[description = "Check-in notes"] notes: Option<String>,
) -> Result<()> {
    let guild_id = ctx.guild_id().context("checkin used outside a guild")?;
    let notes = checkin_notes(notes);

    let Some(guest_role) = role_by_name(ctx, &ctx.data().settings.guest_role_name) else {
        return reply_ephemeral(ctx, "❌ The guest role could not be found.").await;
    };

    let user = ctx.author();
    ctx.http()
        .add_member_role(guild_id, user.id, guest_role, Some("check-in"))
        .await
        .context("failed to grant the guest role")?;

    ctx.data()
        .stores
        .checkins
        .insert(
            user.id.get(),
            CheckinRecord {
                user_tag: user.tag(),
                at: Utc::now(),
                notes: notes.clone(),
            },
        )
        .await?;

    ctx.say(format!("✅ Checked in — {}, welcome!", user.tag()))
        .await?;
    info!("{} checked in, notes: {}", user.tag(), notes);
    Ok(())
}

/// Create or close your personal room
#[poise::command(slash_command, guild_only)]
pub async fn room(
    ctx: Context<'_>,
    #[description = "create or close"] action: RoomAction,
    #[description = "Room name"] name: Option<String>,
) -> Result<()> {
    let guild_id = ctx.guild_id().context("room used outside a guild")?;
    let Some(category) = category_by_name(ctx, &ctx.data().settings.rooms_category_name) else {
        return reply_ephemeral(ctx, "❌ The ROOMS category could not be found.").await;
    };

    match action {
        RoomAction::Create => create_room(ctx, guild_id, category, name.as_deref()).await,
        RoomAction::Close => close_room(ctx).await,
    }
}

async fn create_room(
    ctx: Context<'_>,
    guild_id: GuildId,
    category: ChannelId,
    requested: Option<&str>,
) -> Result<()> {
    let user = ctx.author();
    let rooms = &ctx.data().stores.rooms;

    if let Some(existing) = rooms.get(user.id.get()).await {
        let mention = ChannelId::new(existing.channel_id).mention();
        return reply_ephemeral(ctx, format!("❗ You already have a room: {}", mention)).await;
    }

    let base = room_base_name(requested, &user.name);
    let taken: HashSet<String> = ctx
        .guild()
        .map(|guild| guild.channels.values().map(|c| c.name.clone()).collect())
        .unwrap_or_default();
    let channel_name = unique_channel_name(&base, &taken);
    let staff_role = role_by_name(ctx, &ctx.data().settings.staff_role_name);

    // @everyone shares the guild's id
    let mut overwrites = vec![
        PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
            kind: PermissionOverwriteType::Role(RoleId::new(guild_id.get())),
        },
        PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(user.id),
        },
    ];
    if let Some(staff) = staff_role {
        overwrites.push(PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Role(staff),
        });
    }

    let channel = guild_id
        .create_channel(
            ctx.serenity_context(),
            CreateChannel::new(&channel_name)
                .kind(ChannelType::Text)
                .category(category)
                .permissions(overwrites),
        )
        .await
        .with_context(|| format!("failed to create {}", channel_name))?;

    rooms
        .insert(
            user.id.get(),
            RoomRecord {
                channel_id: channel.id.get(),
                name: channel_name.clone(),
            },
        )
        .await?;

    reply_ephemeral(ctx, format!("🏠 Your room is ready: {}", channel.mention())).await?;
    info!("{} opened personal room {}", user.tag(), channel_name);
    Ok(())
}

async fn close_room(ctx: Context<'_>) -> Result<()> {
    let user = ctx.author();
    let rooms = &ctx.data().stores.rooms;

    let Some(record) = rooms.get(user.id.get()).await else {
        return reply_ephemeral(ctx, "❌ You don't have a room.").await;
    };

    let channel_id = ChannelId::new(record.channel_id);
    let exists = ctx
        .guild()
        .map_or(true, |guild| guild.channels.contains_key(&channel_id));
    if exists {
        if let Err(why) = channel_id.delete(ctx.serenity_context()).await {
            if !is_missing_status(http_status(&why)) {
                return Err(why).with_context(|| format!("failed to delete {}", record.name));
            }
            warn!("Room {} of {} was already deleted on Discord", record.name, user.tag());
        }
    } else {
        warn!("Room {} of {} was already gone", record.name, user.tag());
    }
    rooms.remove(user.id.get()).await?;

    reply_ephemeral(ctx, "🚪 Your room has been closed. Thank you for staying!").await?;
    info!("{} closed personal room {}", user.tag(), record.name);
    Ok(())
}

async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, anyhow::Error>,
    data: &Data,
) -> Result<()> {
    match event {
        serenity::FullEvent::Ready { data_about_bot, .. } => {
            info!("Logged in as {}", data_about_bot.user.name);
        }
        serenity::FullEvent::GuildCreate { guild, .. } => {
            data.voice.sweep_guild(ctx, guild.id);
        }
        serenity::FullEvent::VoiceStateUpdate { old, new } => {
            if let Err(why) = data
                .voice
                .on_voice_state_update(ctx, old.as_ref(), new)
                .await
            {
                error!("Failed to handle voice state update: {:?}", why);
            }
        }
        serenity::FullEvent::ChannelDelete { channel, .. } => {
            data.voice.on_channel_delete(channel.guild_id, channel.id);
            let removed = data
                .stores
                .rooms
                .remove_where(|r| r.channel_id == channel.id.get())
                .await?;
            if removed > 0 {
                info!("Personal room {} was deleted, record dropped", channel.name);
            }
        }
        _ => {}
    }
    Ok(())
}

async fn on_error(error: poise::FrameworkError<'_, Data, anyhow::Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!("Error in command `{}`: {:?}", ctx.command().name, error);
            let reply = CreateReply::default()
                .content("⚠️ Something went wrong while running that command.")
                .ephemeral(true);
            if let Err(why) = ctx.send(reply).await {
                warn!("Failed to report command error: {:?}", why);
            }
        }
        error => {
            if let Err(why) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {:?}", why);
            }
        }
    }
}

pub async fn start(settings: Settings) -> Result<()> {
    let token = settings.token.clone();
    let intents = serenity::GatewayIntents::GUILDS | serenity::GatewayIntents::GUILD_VOICE_STATES;
    let data = Data::new(settings).await?;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![checkin(), room()],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                info!("Registered {} commands", framework.options().commands.len());
                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .context("failed to create the client")?;
    client.start().await.context("client stopped")?;
    Ok(())
}
