/// Redis key builder for the lobby store.
///
/// The body, version and lock keys of one lobby share an `{id}` hash tag so
/// they colocate in a single cluster slot; the per-mode open set deliberately
/// hashes on the mode instead.
#[derive(Clone, Debug, Default)]
pub struct RedisKeys;

impl RedisKeys {
    /// JSON lobby body, TTL bound to the lobby's `expire_at`.
    pub fn lobby_body(id: &str) -> String {
        format!("lobby:{{{id}}}")
    }

    /// Monotone version counter, same TTL as the body.
    pub fn lobby_version(id: &str) -> String {
        format!("lobby:version:{{{id}}}")
    }

    /// Named mutex guarding read-modify-write player inserts.
    pub fn lobby_lock(id: &str) -> String {
        format!("lock:lobby:{{{id}}}")
    }

    /// Sorted set of open lobby ids for a mode, scored by the mode's
    /// score provider.
    pub fn open_lobbies(mode: &str) -> String {
        format!("lobby:active:{mode}")
    }

    /// Pub/sub channel carrying status frames for a lobby.
    pub fn lobby_updates_channel(id: &str) -> String {
        format!("lobby.updates.{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lobby_keys_share_a_hash_tag() {
        assert_eq!(RedisKeys::lobby_body("a1b2"), "lobby:{a1b2}");
        assert_eq!(RedisKeys::lobby_version("a1b2"), "lobby:version:{a1b2}");
        assert_eq!(RedisKeys::lobby_lock("a1b2"), "lock:lobby:{a1b2}");
    }

    #[test]
    fn open_set_is_keyed_by_mode() {
        assert_eq!(RedisKeys::open_lobbies("classic"), "lobby:active:classic");
    }

    #[test]
    fn channel_is_keyed_by_lobby() {
        assert_eq!(
            RedisKeys::lobby_updates_channel("a1b2"),
            "lobby.updates.a1b2"
        );
    }
}
