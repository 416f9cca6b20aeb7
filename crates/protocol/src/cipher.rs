//! Message identifier obfuscation
//!
//! Only the two identifier bytes of a frame are ciphered; payloads are never
//! touched. Both ends of a channel evolve their key once per ciphered frame,
//! so a skipped or doubled advance desynchronizes the channel for good and
//! only a reconnect recovers it.
//!
//! # Variants
//! - **Legacy**: `state = 0x343FD * state + key2`, seeded once per epoch.
//!   A zero seed disables obfuscation.
//! - **Three-key**: `active = active * k3 + k2`, reset to `k1` at the start
//!   of every in-game epoch and after the configured re-seed message.
//!
//! In both cases the identifier is XORed with `(key >> 16) & 0x7FFF` of the
//! freshly advanced key.

use korelink_core::MessageId;
use tracing::{trace, warn};

/// Default legacy re-seed trigger (`initialize_message_id_encryption`)
pub const DEFAULT_LEGACY_TRIGGER: MessageId = MessageId(0x02AE);

const LEGACY_MULTIPLIER: u32 = 0x343FD;

/// Cipher algorithm and keys for one server profile
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CipherProfile {
    /// Plaintext identifiers
    #[default]
    None,

    /// Single rolling key
    Legacy {
        seed: u32,
        key2: u32,
        /// Upstream message whose two parameters re-seed the epoch
        trigger: MessageId,
    },

    /// Base key, additive constant and multiplier
    ThreeKey {
        k1: u32,
        k2: u32,
        k3: u32,
        /// Message that returns the active key to `k1` once sent
        reseed_message: Option<MessageId>,
    },
}

/// Stateful identifier cipher for one direction of one connection
#[derive(Debug, Clone)]
pub struct MessageCipher {
    profile: CipherProfile,
    state: u32,
    active: bool,
    advances: u64,
}

impl MessageCipher {
    /// A cipher for `profile`, inactive and at its base key
    pub fn new(profile: CipherProfile) -> Self {
        let state = base_key(&profile);
        Self {
            profile,
            state,
            active: false,
            advances: 0,
        }
    }

    /// A cipher that never obfuscates
    pub fn plain() -> Self {
        Self::new(CipherProfile::None)
    }

    /// A new inactive cipher sharing this cipher's current epoch keys
    pub fn fresh_epoch(&self) -> Self {
        Self::new(self.profile.clone())
    }

    pub fn profile(&self) -> &CipherProfile {
        &self.profile
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current key state
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Number of key advances since creation
    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Reset to the base key and start obfuscating
    pub fn activate(&mut self) {
        self.reset();
        self.active = true;
    }

    /// Return the key to the start of the current epoch
    pub fn reset(&mut self) {
        self.state = base_key(&self.profile);
    }

    /// Upstream message that re-seeds a legacy cipher
    pub fn legacy_trigger(&self) -> Option<MessageId> {
        match self.profile {
            CipherProfile::Legacy { trigger, .. } => Some(trigger),
            _ => None,
        }
    }

    /// Start a new legacy epoch with `seed` and `key2`
    pub fn reseed(&mut self, seed: u32, key2: u32) {
        match &mut self.profile {
            CipherProfile::Legacy {
                seed: s, key2: k, ..
            } => {
                *s = seed;
                *k = key2;
                self.state = seed;
                trace!("Legacy cipher re-seeded: seed={:#010X} key2={:#010X}", seed, key2);
            }
            other => warn!("Ignoring legacy re-seed on {:?} cipher", other),
        }
    }

    /// Obfuscate the identifier of an outbound frame
    pub fn encrypt(&mut self, id: MessageId) -> MessageId {
        let wire = self.apply(id);
        self.after(id);
        wire
    }

    /// De-obfuscate the identifier of an inbound frame
    pub fn decrypt(&mut self, wire: MessageId) -> MessageId {
        let id = self.apply(wire);
        self.after(id);
        id
    }

    fn apply(&mut self, id: MessageId) -> MessageId {
        if !self.active {
            return id;
        }
        match self.profile {
            CipherProfile::None => id,
            CipherProfile::Legacy { seed, key2, .. } => {
                if seed == 0 {
                    return id;
                }
                self.state = LEGACY_MULTIPLIER.wrapping_mul(self.state).wrapping_add(key2);
                self.advances += 1;
                MessageId(id.get() ^ mask(self.state))
            }
            CipherProfile::ThreeKey { k2, k3, .. } => {
                self.state = self.state.wrapping_mul(k3).wrapping_add(k2);
                self.advances += 1;
                MessageId(id.get() ^ mask(self.state))
            }
        }
    }

    fn after(&mut self, id: MessageId) {
        if !self.active {
            return;
        }
        if let CipherProfile::ThreeKey {
            k1,
            reseed_message: Some(reseed),
            ..
        } = self.profile
        {
            if id == reseed {
                self.state = k1;
            }
        }
    }
}

impl Default for MessageCipher {
    fn default() -> Self {
        Self::plain()
    }
}

fn base_key(profile: &CipherProfile) -> u32 {
    match profile {
        CipherProfile::None => 0,
        CipherProfile::Legacy { seed, .. } => *seed,
        CipherProfile::ThreeKey { k1, .. } => *k1,
    }
}

#[inline]
fn mask(key: u32) -> u16 {
    ((key >> 16) & 0x7FFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_key(reseed: Option<u16>) -> CipherProfile {
        CipherProfile::ThreeKey {
            k1: 0x0100_0000,
            k2: 1,
            k3: 3,
            reseed_message: reseed.map(MessageId),
        }
    }

    fn legacy(seed: u32) -> CipherProfile {
        CipherProfile::Legacy {
            seed,
            key2: 0x1234_5678,
            trigger: DEFAULT_LEGACY_TRIGGER,
        }
    }

    #[test]
    fn test_three_key_vector() {
        let mut cipher = MessageCipher::new(three_key(None));
        cipher.activate();
        assert_eq!(cipher.encrypt(MessageId(0x0064)), MessageId(0x0364));
        assert_eq!(cipher.state(), 0x0300_0001);
        assert_eq!(cipher.advances(), 1);
    }

    #[test]
    fn test_round_trip_both_variants() {
        for profile in [three_key(None), legacy(0xCAFE_BABE)] {
            let mut sender = MessageCipher::new(profile.clone());
            let mut receiver = MessageCipher::new(profile);
            sender.activate();
            receiver.activate();

            for raw in 0..500u16 {
                let id = MessageId(raw.wrapping_mul(131));
                let wire = sender.encrypt(id);
                assert_eq!(receiver.decrypt(wire), id);
            }
            assert_eq!(sender.state(), receiver.state());
            assert_eq!(sender.advances(), 500);
        }
    }

    #[test]
    fn test_skipped_advance_desyncs() {
        let mut sender = MessageCipher::new(three_key(None));
        let mut receiver = MessageCipher::new(three_key(None));
        sender.activate();
        receiver.activate();

        let _lost = sender.encrypt(MessageId(0x0089));
        let wire = sender.encrypt(MessageId(0x007E));
        assert_ne!(receiver.decrypt(wire), MessageId(0x007E));
    }

    #[test]
    fn test_three_key_reseed_message_returns_to_base() {
        let mut sender = MessageCipher::new(three_key(Some(0x0436)));
        let mut receiver = MessageCipher::new(three_key(Some(0x0436)));
        sender.activate();
        receiver.activate();

        for id in [0x0089u16, 0x00F3, 0x0436, 0x007E] {
            let wire = sender.encrypt(MessageId(id));
            assert_eq!(receiver.decrypt(wire), MessageId(id));
            if id == 0x0436 {
                assert_eq!(sender.state(), 0x0100_0000);
                assert_eq!(receiver.state(), 0x0100_0000);
            }
        }
    }

    #[test]
    fn test_legacy_zero_seed_is_noop() {
        let mut cipher = MessageCipher::new(legacy(0));
        cipher.activate();
        assert_eq!(cipher.encrypt(MessageId(0x0064)), MessageId(0x0064));
        assert_eq!(cipher.advances(), 0);
        assert_eq!(cipher.state(), 0);
    }

    #[test]
    fn test_legacy_reseed() {
        let mut cipher = MessageCipher::new(legacy(0));
        cipher.activate();
        assert_eq!(cipher.legacy_trigger(), Some(DEFAULT_LEGACY_TRIGGER));

        cipher.reseed(7, 11);
        let expected = 0x343FDu32.wrapping_mul(7).wrapping_add(11);
        let wire = cipher.encrypt(MessageId(0x0089));
        assert_eq!(cipher.state(), expected);
        assert_eq!(wire, MessageId(0x0089 ^ mask(expected)));
    }

    #[test]
    fn test_inactive_cipher_passes_through() {
        let mut cipher = MessageCipher::new(three_key(None));
        assert!(!cipher.is_active());
        assert_eq!(cipher.encrypt(MessageId(0x0064)), MessageId(0x0064));
        assert_eq!(cipher.advances(), 0);

        assert_eq!(cipher.state(), 0x0100_0000);
    }

    #[test]
    fn test_fresh_epoch_shares_keys() {
        let mut upstream = MessageCipher::new(legacy(0));
        upstream.reseed(99, 5);
        upstream.activate();
        upstream.encrypt(MessageId(0x0089));

        let client = upstream.fresh_epoch();
        assert!(!client.is_active());
        assert_eq!(client.state(), 99);
        assert_eq!(client.profile(), upstream.profile());
    }
}
