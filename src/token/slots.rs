use std::sync::Arc;

use cryptoki::error::RvError;
use log::{debug, trace, warn};

use super::{
    api::{Pkcs11Api, SlotId},
    objects,
    pin::{TokenData, TokenFlags},
    session::SessionSlot,
};
use crate::cert::{CertInspector, KeyUsage};

//------------ SlotList ------------------------------------------------------

/// The slots with a token present, as of the last enumeration.
///
/// Must be refreshed whenever cards are inserted or removed.
#[derive(Clone, Debug, Default)]
pub struct SlotList {
    slots: Vec<SlotId>,
}

impl SlotList {
    pub fn refresh(&mut self, api: &dyn Pkcs11Api) -> Result<(), RvError> {
        self.slots.clear();
        self.slots = api.get_slot_list(true)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The distinct card identifiers (token serial numbers) in the slot list, in descending order.
///
/// A card exposing several slots, e.g. one per PIN, is reported once.
pub fn card_ids(api: &dyn Pkcs11Api, slots: &SlotList) -> Vec<String> {
    let mut cards: Vec<String> = slots
        .iter()
        .filter_map(|slot| match api.get_token_info(slot) {
            Ok(info) => Some(info.serial()),
            Err(err) => {
                warn!("PKCS#11: Failed to obtain token info for slot {}: {}", slot, err);
                None
            }
        })
        .collect();
    cards.sort_unstable_by(|a, b| b.cmp(a));
    cards.dedup();
    cards
}

/// Finds the first slot holding card `card` whose certificate allows `usage`.
///
/// Every candidate is probed through a fresh session in `sessions`. On success that session is left open on the
/// returned slot; otherwise no session is left open.
pub fn find_card_slot(
    api: &Arc<dyn Pkcs11Api>,
    slots: &SlotList,
    sessions: &mut SessionSlot,
    inspector: &dyn CertInspector,
    card: &str,
    usage: KeyUsage,
) -> Option<(SlotId, TokenData)> {
    for slot in slots.iter() {
        let info = match api.get_token_info(slot) {
            Ok(info) => info,
            Err(err) => {
                trace!("PKCS#11: Skipping slot {}: {}", slot, err);
                continue;
            }
        };
        if info.serial() != card {
            continue;
        }

        let session = match sessions.reopen(api, slot) {
            Ok(session) => session,
            Err(err) => {
                warn!("PKCS#11: Unable to open session on slot {}: {}", slot, err);
                continue;
            }
        };
        let cert = match objects::read_certificate(session).and_then(|der| inspector.inspect(&der)) {
            Some(cert) if cert.has_key_usage(usage) => cert,
            _ => {
                trace!("PKCS#11: Slot {} of card {} has no certificate for {}", slot, card, usage);
                continue;
            }
        };

        debug!("PKCS#11: Selected slot {} for card {} ({})", slot, card, usage);
        let data = TokenData {
            card: card.to_string(),
            cert: Some(cert),
            flags: TokenFlags::from_token_flags(info.flags),
        };
        return Some((slot, data));
    }

    sessions.close();
    None
}
