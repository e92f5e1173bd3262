use anyhow::{anyhow, Context as _, Result};
use dotenv::dotenv;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from `.env` and the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub token: String,
    /// Directory holding `rooms.json` and `checkins.json`
    pub data_dir: PathBuf,
    pub lobby_channel_name: String,
    pub voice_category_name: String,
    /// How long an empty voice room survives before it is removed
    pub room_delete_delay: Duration,
    pub first_room_number: u32,
    pub guest_role_name: String,
    pub staff_role_name: String,
    pub rooms_category_name: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let token = lookup("DISCORD_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("missing DISCORD_TOKEN"))?;

        Ok(Self {
            token,
            data_dir: PathBuf::from(text("DATA_DIR", "data")),
            lobby_channel_name: text("LOBBY_CHANNEL_NAME", "🎤｜Lobby"),
            voice_category_name: text("VOICE_CATEGORY_NAME", "🎧 Voice Rooms"),
            room_delete_delay: Duration::from_millis(parsed(&lookup, "ROOM_DELETE_DELAY_MS", 5000)?),
            first_room_number: parsed(&lookup, "FIRST_ROOM_NUMBER", 101)?,
            guest_role_name: text("GUEST_ROLE_NAME", "🛎️ 손님"),
            staff_role_name: text("STAFF_ROLE_NAME", "🧹 직원"),
            rooms_category_name: text("ROOMS_CATEGORY_NAME", "🛏️ ROOMS"),
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let settings = Settings::from_lookup(lookup_from(&[("DISCORD_TOKEN", "abc")])).unwrap();
        assert_eq!(settings.token, "abc");
        assert_eq!(settings.data_dir, PathBuf::from("data"));
        assert_eq!(settings.room_delete_delay, Duration::from_millis(5000));
        assert_eq!(settings.first_room_number, 101);
        assert_eq!(settings.lobby_channel_name, "🎤｜Lobby");
        assert_eq!(settings.guest_role_name, "🛎️ 손님");
        assert_eq!(settings.staff_role_name, "🧹 직원");
    }

    #[test]
    fn missing_or_blank_token_is_rejected() {
        assert!(Settings::from_lookup(lookup_from(&[])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("DISCORD_TOKEN", "  ")])).is_err());
    }

    #[test]
    fn overrides_are_honoured() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DISCORD_TOKEN", "abc"),
            ("ROOM_DELETE_DELAY_MS", "250"),
            ("FIRST_ROOM_NUMBER", "201"),
            ("LOBBY_CHANNEL_NAME", "lobby"),
        ]))
        .unwrap();
        assert_eq!(settings.room_delete_delay, Duration::from_millis(250));
        assert_eq!(settings.first_room_number, 201);
        assert_eq!(settings.lobby_channel_name, "lobby");
    }

    #[test]
    fn bad_numbers_are_an_error() {
        let err = Settings::from_lookup(lookup_from(&[
            ("DISCORD_TOKEN", "abc"),
            ("ROOM_DELETE_DELAY_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ROOM_DELETE_DELAY_MS"));
    }
}
