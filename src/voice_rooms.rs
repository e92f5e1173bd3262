//! Ephemeral voice rooms.
//!
//! Joining the lobby voice channel opens a numbered `Room NNN` next to it and
//! moves the member in. A room that empties out is removed after a delay,
//! unless someone comes back first.

use anyhow::{Context as _, Result};
use log::{debug, error, info, warn};
use poise::serenity_prelude as serenity;
use regex::Regex;
use serenity::{
    ChannelId, ChannelType, CreateChannel, GuildId, PermissionOverwrite, PermissionOverwriteType,
    Permissions, RoleId, UserId, VoiceState,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::Settings;

/// Recognises and renders `Room NNN` channel names.
pub struct RoomNames {
    pattern: Regex,
    first: u32,
}

impl RoomNames {
    pub fn new(first: u32) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"^Room\s+(\d{3})$").context("invalid room name pattern")?,
            first,
        })
    }

    pub fn parse(&self, name: &str) -> Option<u32> {
        let caps = self.pattern.captures(name)?;
        caps.get(1)?.as_str().parse().ok()
    }

    pub fn format(number: u32) -> String {
        format!("Room {:03}", number)
    }

    pub fn first(&self) -> u32 {
        self.first
    }
}

/// Lowest number at or above `first` that is not taken.
pub fn lowest_free(taken: &BTreeSet<u32>, first: u32) -> u32 {
    let mut candidate = first;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// In-memory bookkeeping that keeps concurrent gateway events from
/// opening or removing the same room twice.
#[derive(Debug, Default)]
pub struct RoomBook {
    creating: HashSet<UserId>,
    reserved: HashSet<u32>,
    live: HashMap<ChannelId, u32>,
    deleting: HashSet<ChannelId>,
}

impl RoomBook {
    /// Returns false when a room for this member is already being opened.
    pub fn begin_create(&mut self, user_id: UserId) -> bool {
        self.creating.insert(user_id)
    }

    /// Hands out the lowest number not used by a cached channel, a live
    /// room or another in-flight creation.
    pub fn reserve<I>(&mut self, cached: I, first: u32) -> u32
    where
        I: IntoIterator<Item = u32>,
    {
        let taken: BTreeSet<u32> = cached
            .into_iter()
            .chain(self.live.values().copied())
            .chain(self.reserved.iter().copied())
            .collect();
        let number = lowest_free(&taken, first);
        self.reserved.insert(number);
        number
    }

    pub fn confirm(&mut self, user_id: UserId, number: u32, channel_id: ChannelId) {
        self.creating.remove(&user_id);
        self.reserved.remove(&number);
        self.live.insert(channel_id, number);
    }

    pub fn abandon(&mut self, user_id: UserId, number: u32) {
        self.creating.remove(&user_id);
        self.reserved.remove(&number);
    }

    pub fn live_number(&self, channel_id: ChannelId) -> Option<u32> {
        self.live.get(&channel_id).copied()
    }

    /// Returns false when a delete request for the channel is already out.
    pub fn begin_delete(&mut self, channel_id: ChannelId) -> bool {
        self.deleting.insert(channel_id)
    }

    pub fn finish_delete(&mut self, channel_id: ChannelId, deleted: bool) {
        self.deleting.remove(&channel_id);
        if deleted {
            self.live.remove(&channel_id);
        }
    }

    pub fn forget(&mut self, channel_id: ChannelId) {
        self.deleting.remove(&channel_id);
        self.live.remove(&channel_id);
    }
}

/// Pending delayed deletions, one per channel.
#[derive(Debug, Default)]
pub struct ReapTimers {
    next_generation: u64,
    pending: HashMap<ChannelId, (u64, JoinHandle<()>)>,
}

impl ReapTimers {
    /// Replaces any pending timer for the channel with the one `spawn` starts.
    pub fn arm<F>(&mut self, channel_id: ChannelId, spawn: F) -> u64
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        self.cancel(channel_id);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.pending.insert(channel_id, (generation, spawn(generation)));
        generation
    }

    pub fn cancel(&mut self, channel_id: ChannelId) -> bool {
        match self.pending.remove(&channel_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a firing timer; only the current generation may clear the slot.
    pub fn disarm(&mut self, channel_id: ChannelId, generation: u64) -> bool {
        match self.pending.get(&channel_id) {
            Some((current, _)) if *current == generation => {
                self.pending.remove(&channel_id);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, channel_id: ChannelId) -> bool {
        self.pending.contains_key(&channel_id)
    }
}

/// Lobby and its category in one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub category: ChannelId,
    pub lobby: ChannelId,
}

/// What one voice-state change asks of the room manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VoicePlan {
    /// Channel whose pending deletion should be called off
    pub cancel: Option<ChannelId>,
    pub open_room: bool,
    /// Channel the member left; a candidate for removal if it is a room
    pub left: Option<ChannelId>,
}

pub fn plan_voice_change(before: Option<ChannelId>, after: Option<ChannelId>, layout: Layout) -> VoicePlan {
    // Mute/deafen updates keep the same channel and change nothing.
    if before == after {
        return VoicePlan {
            cancel: after,
            ..VoicePlan::default()
        };
    }
    VoicePlan {
        cancel: after,
        open_room: after == Some(layout.lobby),
        left: before.filter(|left| *left != layout.lobby),
    }
}

/// The fields of a guild channel that decide whether it is a room.
#[derive(Debug, Clone, Copy)]
pub struct ChannelView<'a> {
    pub id: ChannelId,
    pub kind: ChannelType,
    pub parent_id: Option<ChannelId>,
    pub name: &'a str,
}

impl<'a> From<&'a serenity::GuildChannel> for ChannelView<'a> {
    fn from(channel: &'a serenity::GuildChannel) -> Self {
        Self {
            id: channel.id,
            kind: channel.kind,
            parent_id: channel.parent_id,
            name: &channel.name,
        }
    }
}

pub fn is_room_channel(names: &RoomNames, channel: ChannelView<'_>, layout: Layout) -> bool {
    channel.kind == ChannelType::Voice
        && channel.id != layout.lobby
        && channel.parent_id == Some(layout.category)
        && names.parse(channel.name).is_some()
}

/// Rooms nobody is connected to.
pub fn empty_rooms<'a, I>(
    names: &RoomNames,
    layout: Layout,
    channels: I,
    occupied: &HashSet<ChannelId>,
) -> Vec<ChannelId>
where
    I: IntoIterator<Item = ChannelView<'a>>,
{
    channels
        .into_iter()
        .filter(|c| is_room_channel(names, *c, layout))
        .filter(|c| !occupied.contains(&c.id))
        .map(|c| c.id)
        .collect()
}

pub struct VoiceRooms {
    lobby_name: String,
    category_name: String,
    delete_delay: Duration,
    names: RoomNames,
    book: Mutex<RoomBook>,
    timers: Mutex<ReapTimers>,
    layouts: Mutex<HashMap<GuildId, Layout>>,
    setup_lock: tokio::sync::Mutex<()>,
}

impl VoiceRooms {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            lobby_name: settings.lobby_channel_name.clone(),
            category_name: settings.voice_category_name.clone(),
            delete_delay: settings.room_delete_delay,
            names: RoomNames::new(settings.first_room_number)?,
            book: Mutex::default(),
            timers: Mutex::default(),
            layouts: Mutex::default(),
            setup_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn book(&self) -> MutexGuard<'_, RoomBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, ReapTimers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layouts(&self) -> MutexGuard<'_, HashMap<GuildId, Layout>> {
        self.layouts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn on_voice_state_update(
        self: &Arc<Self>,
        ctx: &serenity::Context,
        old: Option<&VoiceState>,
        new: &VoiceState,
    ) -> Result<()> {
        let Some(guild_id) = new.guild_id.or_else(|| old.and_then(|o| o.guild_id)) else {
            return Ok(());
        };
        let layout = self.ensure_layout(ctx, guild_id).await?;

        let plan = plan_voice_change(old.and_then(|o| o.channel_id), new.channel_id, layout);

        if let Some(joined) = plan.cancel {
            if self.timers().cancel(joined) {
                debug!("Deletion of {} cancelled, someone joined", joined);
            }
        }

        if plan.open_room {
            self.open_room(ctx, guild_id, layout, new.user_id).await?;
        }

        if let Some(left) = plan.left {
            if self.is_auto_room(ctx, guild_id, layout, left)
                && occupancy(ctx, guild_id, left) == Some(0)
            {
                self.schedule_delete(ctx, guild_id, left);
            }
        }

        Ok(())
    }

    pub fn on_channel_delete(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.timers().cancel(channel_id);
        self.book().forget(channel_id);
        let mut layouts = self.layouts();
        if layouts
            .get(&guild_id)
            .map_or(false, |l| l.category == channel_id || l.lobby == channel_id)
        {
            layouts.remove(&guild_id);
        }
    }

    /// Schedules removal of rooms that were left empty by a previous run.
    pub fn sweep_guild(self: &Arc<Self>, ctx: &serenity::Context, guild_id: GuildId) {
        let (category, lobby) = self.cached_layout(ctx, guild_id);
        let (Some(category), Some(lobby)) = (category, lobby) else {
            return;
        };
        let layout = Layout { category, lobby };

        let empty_rooms: Vec<ChannelId> = {
            let Some(guild) = ctx.cache.guild(guild_id) else {
                return;
            };
            let occupied: HashSet<ChannelId> = guild
                .voice_states
                .values()
                .filter_map(|vs| vs.channel_id)
                .collect();
            empty_rooms(
                &self.names,
                layout,
                guild.channels.values().map(ChannelView::from),
                &occupied,
            )
        };

        for channel_id in empty_rooms {
            info!("Found empty room {} in guild {}, scheduling removal", channel_id, guild_id);
            self.schedule_delete(ctx, guild_id, channel_id);
        }
    }

    fn is_auto_room(
        &self,
        ctx: &serenity::Context,
        guild_id: GuildId,
        layout: Layout,
        channel_id: ChannelId,
    ) -> bool {
        if channel_id == layout.lobby {
            return false;
        }
        if self.book().live_number(channel_id).is_some() {
            return true;
        }
        ctx.cache
            .guild(guild_id)
            .and_then(|guild| {
                guild
                    .channels
                    .get(&channel_id)
                    .map(|c| is_room_channel(&self.names, c.into(), layout))
            })
            .unwrap_or(false)
    }

    fn cached_layout(
        &self,
        ctx: &serenity::Context,
        guild_id: GuildId,
    ) -> (Option<ChannelId>, Option<ChannelId>) {
        let known = self.layouts().get(&guild_id).copied();
        let (category, lobby) = match ctx.cache.guild(guild_id) {
            Some(guild) => {
                let category = guild
                    .channels
                    .values()
                    .find(|c| c.kind == ChannelType::Category && c.name == self.category_name)
                    .map(|c| c.id);
                let lobby = guild
                    .channels
                    .values()
                    .find(|c| c.kind == ChannelType::Voice && c.name == self.lobby_name)
                    .map(|c| c.id);
                (category, lobby)
            }
            None => (None, None),
        };
        // Channels we just created may not have reached the cache yet.
        (
            category.or(known.map(|l| l.category)),
            lobby.or(known.map(|l| l.lobby)),
        )
    }

    async fn ensure_layout(&self, ctx: &serenity::Context, guild_id: GuildId) -> Result<Layout> {
        let _guard = self.setup_lock.lock().await;
        let (category, lobby) = self.cached_layout(ctx, guild_id);

        let category = match category {
            Some(id) => id,
            None => {
                let channel = guild_id
                    .create_channel(
                        ctx,
                        CreateChannel::new(&self.category_name).kind(ChannelType::Category),
                    )
                    .await
                    .with_context(|| format!("failed to create category {}", self.category_name))?;
                info!("Created voice category {} in guild {}", channel.name, guild_id);
                channel.id
            }
        };

        let lobby = match lobby {
            Some(id) => id,
            None => {
                let channel = guild_id
                    .create_channel(
                        ctx,
                        CreateChannel::new(&self.lobby_name)
                            .kind(ChannelType::Voice)
                            .category(category),
                    )
                    .await
                    .with_context(|| format!("failed to create lobby {}", self.lobby_name))?;
                info!("Created lobby {} in guild {}", channel.name, guild_id);
                channel.id
            }
        };

        let layout = Layout { category, lobby };
        self.layouts().insert(guild_id, layout);
        Ok(layout)
    }

    async fn open_room(
        self: &Arc<Self>,
        ctx: &serenity::Context,
        guild_id: GuildId,
        layout: Layout,
        user_id: UserId,
    ) -> Result<()> {
        if !self.book().begin_create(user_id) {
            debug!("Room for {} is already being opened", user_id);
            return Ok(());
        }

        let cached: Vec<u32> = ctx
            .cache
            .guild(guild_id)
            .map(|guild| {
                guild
                    .channels
                    .values()
                    .filter(|c| c.kind == ChannelType::Voice && c.parent_id == Some(layout.category))
                    .filter_map(|c| self.names.parse(&c.name))
                    .collect()
            })
            .unwrap_or_default();
        let number = self.book().reserve(cached, self.names.first());
        let name = RoomNames::format(number);

        // @everyone shares the guild's id
        let everyone = PermissionOverwrite {
            allow: Permissions::CONNECT | Permissions::VIEW_CHANNEL,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Role(RoleId::new(guild_id.get())),
        };
        let created = guild_id
            .create_channel(
                ctx,
                CreateChannel::new(&name)
                    .kind(ChannelType::Voice)
                    .category(layout.category)
                    .permissions(vec![everyone])
                    .audit_log_reason("voice lobby join"),
            )
            .await;

        let channel = match created {
            Ok(channel) => channel,
            Err(why) => {
                self.book().abandon(user_id, number);
                return Err(why).with_context(|| format!("failed to create {}", name));
            }
        };
        self.book().confirm(user_id, number, channel.id);
        info!("Opened {} ({}) for {}", name, channel.id, user_id);

        if let Err(why) = guild_id.move_member(ctx, user_id, channel.id).await {
            warn!("Failed to move {} into {}: {:?}", user_id, name, why);
        }

        // Harmless if the member arrived: the timer re-checks occupancy.
        self.schedule_delete(ctx, guild_id, channel.id);
        Ok(())
    }

    fn schedule_delete(self: &Arc<Self>, ctx: &serenity::Context, guild_id: GuildId, channel_id: ChannelId) {
        let this = Arc::clone(self);
        let ctx = ctx.clone();
        let delay = self.delete_delay;
        self.timers().arm(channel_id, move |generation| {
            tokio::spawn(async move {
                sleep(delay).await;
                if !this.timers().disarm(channel_id, generation) {
                    return;
                }
                if let Err(why) = this.reap(&ctx, guild_id, channel_id).await {
                    error!("Failed to remove room {}: {:?}", channel_id, why);
                }
            })
        });
        debug!("Room {} scheduled for removal in {:?}", channel_id, delay);
    }

    async fn reap(&self, ctx: &serenity::Context, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        match occupancy(ctx, guild_id, channel_id) {
            Some(0) => {}
            Some(count) => {
                debug!("Room {} still has {} member(s), keeping it", channel_id, count);
                return Ok(());
            }
            None => return Ok(()),
        }

        if !self.book().begin_delete(channel_id) {
            debug!("Room {} is already being removed", channel_id);
            return Ok(());
        }
        let result = channel_id.delete(ctx).await;
        self.book().finish_delete(channel_id, result.is_ok());
        result.with_context(|| format!("failed to delete {}", channel_id))?;

        info!("Removed empty room {}", channel_id);
        Ok(())
    }
}

/// Members currently connected to the channel, or `None` if it is not cached.
fn occupancy(ctx: &serenity::Context, guild_id: GuildId, channel_id: ChannelId) -> Option<usize> {
    let guild = ctx.cache.guild(guild_id)?;
    if !guild.channels.contains_key(&channel_id) {
        return None;
    }
    Some(
        guild
            .voice_states
            .values()
            .filter(|vs| vs.channel_id == Some(channel_id))
            .count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn user(id: u64) -> UserId {
        UserId::new(id)
    }

    fn channel(id: u64) -> ChannelId {
        ChannelId::new(id)
    }

    #[test]
    fn room_names_round_trip_three_digits() {
        let names = RoomNames::new(101).unwrap();
        assert_eq!(RoomNames::format(101), "Room 101");
        assert_eq!(RoomNames::format(7), "Room 007");
        assert_eq!(names.parse("Room 101"), Some(101));
        assert_eq!(names.parse("Room   042"), Some(42));
        assert_eq!(names.parse("Room 1001"), None);
        assert_eq!(names.parse("room 101"), None);
        assert_eq!(names.parse("🎤｜Lobby"), None);
    }

    fn layout() -> Layout {
        Layout {
            category: channel(1),
            lobby: channel(2),
        }
    }

    fn view(id: u64, kind: ChannelType, parent: Option<u64>, name: &str) -> ChannelView<'_> {
        ChannelView {
            id: channel(id),
            kind,
            parent_id: parent.map(channel),
            name,
        }
    }

    #[test]
    fn staying_in_the_lobby_opens_nothing() {
        let lobby = Some(layout().lobby);
        let plan = plan_voice_change(lobby, lobby, layout());
        assert!(!plan.open_room);
        assert_eq!(plan.left, None);
    }

    #[test]
    fn joining_the_lobby_opens_a_room() {
        let plan = plan_voice_change(None, Some(layout().lobby), layout());
        assert!(plan.open_room);
        assert_eq!(plan.cancel, Some(layout().lobby));
        assert_eq!(plan.left, None);
    }

    #[test]
    fn room_back_to_lobby_opens_and_releases_the_old_room() {
        let plan = plan_voice_change(Some(channel(10)), Some(layout().lobby), layout());
        assert!(plan.open_room);
        assert_eq!(plan.left, Some(channel(10)));
    }

    #[test]
    fn leaving_the_lobby_never_reaps_it() {
        let plan = plan_voice_change(Some(layout().lobby), Some(channel(10)), layout());
        assert!(!plan.open_room);
        assert_eq!(plan.left, None);
        assert_eq!(plan.cancel, Some(channel(10)));

        let plan = plan_voice_change(Some(layout().lobby), None, layout());
        assert_eq!(plan.left, None);
    }

    #[test]
    fn disconnecting_from_a_room_marks_it_left() {
        let plan = plan_voice_change(Some(channel(10)), None, layout());
        assert!(!plan.open_room);
        assert_eq!(plan.cancel, None);
        assert_eq!(plan.left, Some(channel(10)));
    }

    #[test]
    fn only_numbered_voice_channels_in_the_category_are_rooms() {
        let names = RoomNames::new(101).unwrap();
        let is_room = |c| is_room_channel(&names, c, layout());

        assert!(is_room(view(10, ChannelType::Voice, Some(1), "Room 101")));
        assert!(!is_room(view(2, ChannelType::Voice, Some(1), "Room 102")));
        assert!(!is_room(view(11, ChannelType::Text, Some(1), "Room 103")));
        assert!(!is_room(view(12, ChannelType::Voice, Some(99), "Room 104")));
        assert!(!is_room(view(13, ChannelType::Voice, Some(1), "Chill zone")));
        assert!(!is_room(view(14, ChannelType::Voice, None, "Room 105")));
    }

    #[test]
    fn sweep_picks_only_empty_rooms() {
        let names = RoomNames::new(101).unwrap();
        let channels = vec![
            view(2, ChannelType::Voice, Some(1), "🎤｜Lobby"),
            view(10, ChannelType::Voice, Some(1), "Room 101"),
            view(11, ChannelType::Voice, Some(1), "Room 102"),
            view(12, ChannelType::Voice, Some(1), "Music"),
            view(13, ChannelType::Voice, Some(99), "Room 103"),
        ];
        let occupied: HashSet<ChannelId> = [channel(11)].into_iter().collect();

        assert_eq!(
            empty_rooms(&names, layout(), channels, &occupied),
            vec![channel(10)]
        );
    }

    #[test]
    fn lowest_free_fills_gaps() {
        let taken: BTreeSet<u32> = [101, 102, 104].into_iter().collect();
        assert_eq!(lowest_free(&taken, 101), 103);
        assert_eq!(lowest_free(&BTreeSet::new(), 101), 101);
        let below: BTreeSet<u32> = [5, 6].into_iter().collect();
        assert_eq!(lowest_free(&below, 101), 101);
    }

    #[test]
    fn one_creation_per_member() {
        let mut book = RoomBook::default();
        assert!(book.begin_create(user(1)));
        assert!(!book.begin_create(user(1)));
        assert!(book.begin_create(user(2)));

        let number = book.reserve([], 101);
        book.abandon(user(1), number);
        assert!(book.begin_create(user(1)));
    }

    #[test]
    fn concurrent_reservations_get_distinct_numbers() {
        let mut book = RoomBook::default();
        let a = book.reserve([101], 101);
        let b = book.reserve([101], 101);
        assert_eq!((a, b), (102, 103));

        // Confirmed rooms stay taken even before the cache sees them.
        book.confirm(user(1), a, channel(10));
        let c = book.reserve([], 101);
        assert_eq!(c, 101);
        let d = book.reserve([], 101);
        assert_eq!(d, 104);
    }

    #[test]
    fn abandoned_numbers_are_reused() {
        let mut book = RoomBook::default();
        book.begin_create(user(1));
        let number = book.reserve([], 101);
        book.abandon(user(1), number);
        assert_eq!(book.reserve([], 101), number);
    }

    #[test]
    fn one_delete_per_channel() {
        let mut book = RoomBook::default();
        book.begin_create(user(1));
        let number = book.reserve([], 101);
        book.confirm(user(1), number, channel(10));

        assert!(book.begin_delete(channel(10)));
        assert!(!book.begin_delete(channel(10)));

        book.finish_delete(channel(10), false);
        assert_eq!(book.live_number(channel(10)), Some(101));

        assert!(book.begin_delete(channel(10)));
        book.finish_delete(channel(10), true);
        assert_eq!(book.live_number(channel(10)), None);
    }

    #[test]
    fn forget_clears_everything_for_a_channel() {
        let mut book = RoomBook::default();
        book.confirm(user(1), 101, channel(10));
        book.begin_delete(channel(10));
        book.forget(channel(10));
        assert_eq!(book.live_number(channel(10)), None);
        assert!(book.begin_delete(channel(10)));
    }

    #[tokio::test]
    async fn rearming_aborts_the_previous_timer() {
        let mut timers = ReapTimers::default();
        let (tx, rx) = oneshot::channel::<()>();

        let first = timers.arm(channel(10), |_| {
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            })
        });
        let second = timers.arm(channel(10), |_| tokio::spawn(std::future::pending::<()>()));

        assert!(rx.await.is_err());
        assert_ne!(first, second);
        assert!(!timers.disarm(channel(10), first));
        assert!(timers.is_armed(channel(10)));
        assert!(timers.disarm(channel(10), second));
        assert!(!timers.is_armed(channel(10)));
    }

    #[tokio::test]
    async fn cancel_stops_a_pending_timer() {
        let mut timers = ReapTimers::default();
        let (tx, rx) = oneshot::channel::<()>();
        timers.arm(channel(10), |_| {
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            })
        });

        assert!(timers.cancel(channel(10)));
        assert!(!timers.cancel(channel(10)));
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay_and_clears_its_slot() {
        let timers = Arc::new(Mutex::new(ReapTimers::default()));
        let (tx, rx) = oneshot::channel::<bool>();

        let shared = Arc::clone(&timers);
        timers.lock().unwrap().arm(channel(10), move |generation| {
            tokio::spawn(async move {
                sleep(Duration::from_millis(5000)).await;
                let cleared = shared.lock().unwrap().disarm(channel(10), generation);
                let _ = tx.send(cleared);
            })
        });

        assert!(rx.await.unwrap());
        assert!(!timers.lock().unwrap().is_armed(channel(10)));
    }
}
