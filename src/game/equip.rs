//! Applies `game_player_equip` stripping to the `TriggerForAllPlayers` and
//! `TriggerForActivatedPlayer` inputs, which don't go through `Use`.

use std::sync::Arc;

use eyre::Result;

use crate::{
    error::FixError,
    game::{
        strip::{InputData, Stripper},
        Context, Fix,
    },
    hook::{self, Token},
    host::{Host, Memory},
    native_target,
};

pub const TRIGGER_FOR_ALL_PLAYERS: &str = "CGamePlayerEquip::InputTriggerForAllPlayers";
pub const TRIGGER_FOR_ACTIVATED_PLAYER: &str = "CGamePlayerEquip::InputTriggerForActivatedPlayer";

native_target!(all_players, fn(equip: usize, input: usize));
native_target!(activated_player, fn(equip: usize, input: usize));

/// Where a `variant_t` keeps its field type.
const VARIANT_TAG_OFFSET: usize = 20;

/// The variant holds a pointer to a C string.
const TAG_C_STRING: i32 = 14;

/// The variant holds a pointer to a pointer to a C string.
const TAG_STRING: i32 = 2;

/// Reads the item name out of the `variant_t` at `variant`, if it holds one.
pub fn decode_variant(memory: &dyn Memory, variant: usize) -> Option<String> {
    if variant == 0 {
        return None;
    }

    let tag = memory.read_i32(variant + VARIANT_TAG_OFFSET)?;
    let pointer = memory.read_usize(variant).filter(|pointer| *pointer != 0)?;

    let text = match tag {
        TAG_C_STRING => memory.read_c_str(pointer)?,
        TAG_STRING => {
            let inner = memory.read_usize(pointer).filter(|inner| *inner != 0)?;
            memory.read_c_str(inner)?
        }

        _ => return None,
    };

    (!text.is_empty() && text != "(null)").then_some(text)
}

/// Strips every live player for the equip entity at `equip`.
fn trigger_for_all(stripper: &Stripper, host: &dyn Host, equip: usize) -> Result<()> {
    let equip = host
        .entity(equip)
        .ok_or(FixError::TransientState { address: equip })?;

    for pawn in host.player_pawns() {
        if !pawn.is_live_pawn() {
            continue;
        }

        if let Err(err) = stripper.strip_for(equip.as_ref(), pawn.as_ref()) {
            log::warn!("Unable to strip {:#x}: {err:?}", pawn.address());
        }
    }

    Ok(())
}

/// Strips the activator and gives it the item named by the input, if any. Returns `true` if
/// the original input handler should still run.
fn trigger_for_activated(
    stripper: &Stripper,
    host: &dyn Host,
    memory: &dyn Memory,
    equip: usize,
    input: usize,
) -> Result<bool> {
    let equip = host
        .entity(equip)
        .ok_or(FixError::TransientState { address: equip })?;

    let input = match InputData::read(memory, input) {
        Some(input) => input,
        None => return Ok(true),
    };

    let pawn = match host.entity(input.activator) {
        Some(pawn) if pawn.is_live_pawn() => pawn,
        _ => return Ok(true),
    };

    if let Err(err) = stripper.strip_for(equip.as_ref(), pawn.as_ref()) {
        log::warn!("Unable to strip {:#x}: {err:?}", pawn.address());
    }

    match decode_variant(memory, input.value) {
        Some(item) => {
            pawn.give_item(&item)?;
            log::debug!("Gave '{item}' to {:#x}.", pawn.address());
            Ok(false)
        }

        None => Ok(true),
    }
}

/// Fans `game_player_equip` stripping out to its trigger inputs.
pub struct EquipFix {
    stripper: Arc<Stripper>,
    all_players: Option<Token>,
    activated_player: Option<Token>,
}

impl EquipFix {
    pub fn new(stripper: Arc<Stripper>) -> EquipFix {
        EquipFix {
            stripper,
            all_players: None,
            activated_player: None,
        }
    }

    fn install_all_players(&mut self, context: &Context) -> Result<()> {
        let function = context
            .resolver()
            .by_signature::<all_players::Function>(TRIGGER_FOR_ALL_PLAYERS)?;

        let stripper = self.stripper.clone();
        let host = context.host.clone();

        let token = context
            .interceptor
            .install(&function, all_players::detour(), move |next| {
                Box::new(move |(equip, input)| {
                    if let Err(err) = trigger_for_all(&stripper, &*host, equip) {
                        log::error!("Error in TriggerForAllPlayers for {equip:#x}: {err:?}");
                    }

                    next.call((equip, input))
                })
            })?;

        self.all_players = Some(token);
        Ok(())
    }

    fn install_activated_player(&mut self, context: &Context) -> Result<()> {
        let function = context
            .resolver()
            .by_signature::<activated_player::Function>(TRIGGER_FOR_ACTIVATED_PLAYER)?;

        let stripper = self.stripper.clone();
        let host = context.host.clone();
        let memory = context.memory.clone();

        let token = context
            .interceptor
            .install(&function, activated_player::detour(), move |next| {
                Box::new(move |(equip, input)| {
                    let forward =
                        trigger_for_activated(&stripper, &*host, &*memory, equip, input)
                            .unwrap_or_else(|err| {
                                log::error!(
                                    "Error in TriggerForActivatedPlayer for {equip:#x}: {err:?}"
                                );
                                true
                            });

                    if forward {
                        next.call((equip, input));
                    }
                })
            })?;

        self.activated_player = Some(token);
        Ok(())
    }
}

impl Fix for EquipFix {
    fn name(&self) -> &str {
        "TriggerForPlayerFix"
    }

    /// Each input is optional on its own, but at least one has to be found.
    fn install(&mut self, context: &Context) -> Result<()> {
        if self.all_players.is_none() {
            if let Err(err) = self.install_all_players(context) {
                log::warn!("TriggerForAllPlayers won't be fixed: {err:?}");
            }
        }

        if self.activated_player.is_none() {
            if let Err(err) = self.install_activated_player(context) {
                log::warn!("TriggerForActivatedPlayer won't be fixed: {err:?}");
            }
        }

        if self.all_players.is_none() && self.activated_player.is_none() {
            return Err(FixError::fatal(self.name(), "neither trigger input was found").into());
        }

        Ok(())
    }

    fn uninstall(&mut self, context: &Context) {
        hook::remove_token(&context.interceptor, &mut self.activated_player);
        hook::remove_token(&context.interceptor, &mut self.all_players);
    }
}
