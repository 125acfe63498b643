//! Makes `game_player_equip` strip weapons from the player that used it when the map asks for it.
//!
//! The stripping itself is shared with the trigger fan-out fix, which applies the same rules to
//! every player or to the activator of an input.

use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use eyre::Result;

use crate::{
    entity_key::EntityKey,
    error::FixError,
    game::{
        entity::{Entity, Weapon},
        Context, Fix,
    },
    hook::{self, Token},
    host::{Host, Memory},
    native_target,
    resolver::MethodSlot,
};

/// `game_player_equip` spawn flags.
pub mod spawn_flags {
    /// Remove everything the player has before equipping.
    pub const STRIP_FIRST: u32 = 0x2;

    /// Only remove weapons in the slots the equip entity hands out.
    pub const ONLY_STRIP_SAME: u32 = 0x4;
}

pub const USE: MethodSlot = MethodSlot::new("CGamePlayerEquip", "CBaseEntity::Use");

native_target!(equip_use, fn(equip: usize, input: usize));

/// The start of the engine's `InputData_t`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InputData {
    pub activator: usize,
    pub caller: usize,

    /// Address of the input's `variant_t` value.
    pub value: usize,
}

impl InputData {
    pub fn read(memory: &dyn Memory, address: usize) -> Option<InputData> {
        const WORD: usize = std::mem::size_of::<usize>();

        if address == 0 {
            return None;
        }

        Some(InputData {
            activator: memory.read_usize(address)?,
            caller: memory.read_usize(address + WORD)?,
            value: memory.read_usize(address + 2 * WORD)?,
        })
    }
}

/// The weapon slots each `game_player_equip` strips when it has `ONLY_STRIP_SAME`.
#[derive(Default)]
pub struct EquipStripTable(DashMap<EntityKey, HashSet<u32>>);

impl EquipStripTable {
    /// Sets the slots for the equip entity with `key`. Returns `false` for the invalid key.
    pub fn set(&self, key: EntityKey, slots: impl IntoIterator<Item = u32>) -> bool {
        if !key.is_valid() {
            return false;
        }

        self.0.insert(key, slots.into_iter().collect());
        true
    }

    pub fn remove(&self, key: EntityKey) -> Option<HashSet<u32>> {
        self.0.remove(&key).map(|(_, slots)| slots)
    }

    pub fn get(&self, key: EntityKey) -> Option<HashSet<u32>> {
        self.0.get(&key).map(|slots| slots.clone())
    }

    pub fn clear(&self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Removes weapons from pawns following a `game_player_equip`'s spawn flags.
pub struct Stripper {
    table: Arc<EquipStripTable>,
}

impl Stripper {
    pub fn new(table: Arc<EquipStripTable>) -> Stripper {
        Stripper { table }
    }

    pub fn table(&self) -> &Arc<EquipStripTable> {
        &self.table
    }

    /// Strips `pawn` the way `equip` is configured to. `STRIP_FIRST` wins over
    /// `ONLY_STRIP_SAME`.
    pub fn strip_for(&self, equip: &dyn Entity, pawn: &dyn Entity) -> Result<()> {
        let flags = equip.spawn_flags()?;

        if flags & spawn_flags::STRIP_FIRST != 0 {
            self.strip_all(pawn)
        } else if flags & spawn_flags::ONLY_STRIP_SAME != 0 {
            let slots = self.table.get(equip.key()).unwrap_or_default();
            self.strip_slots(pawn, &slots).map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Removes every item `pawn` carries.
    pub fn strip_all(&self, pawn: &dyn Entity) -> Result<()> {
        log::debug!("Stripping all items from {:#x}.", pawn.address());
        pawn.remove_items()
    }

    /// Drops and respawns each of `pawn`'s weapons that sits in one of `slots`. Returns how many
    /// weapons were stripped.
    pub fn strip_slots(&self, pawn: &dyn Entity, slots: &HashSet<u32>) -> Result<usize> {
        if slots.is_empty() {
            return Ok(0);
        }

        let matching: Vec<Arc<dyn Weapon>> = pawn
            .weapons()?
            .into_iter()
            .filter(|weapon| weapon.is_valid())
            .filter(|weapon| match weapon.slot() {
                Ok(slot) => slots.contains(&slot),
                Err(err) => {
                    log::debug!("Skipping weapon {:#x}: {err:?}", weapon.address());
                    false
                }
            })
            .collect();

        for weapon in &matching {
            pawn.drop_weapon(weapon.as_ref())?;
            weapon.dispatch_spawn()?;
        }

        log::debug!(
            "Stripped {} weapons from {:#x}.",
            matching.len(),
            pawn.address()
        );

        Ok(matching.len())
    }

    /// Handles a `Use` of the equip entity at `equip` with the input at `input`.
    fn on_use(
        &self,
        host: &dyn Host,
        memory: &dyn Memory,
        equip: usize,
        input: usize,
    ) -> Result<()> {
        let equip = host
            .entity(equip)
            .ok_or(FixError::TransientState { address: equip })?;

        let activator =
            InputData::read(memory, input).and_then(|input| host.entity(input.activator));

        let activator = match activator {
            Some(activator) if activator.is_live_pawn() => activator,
            _ => return Ok(()),
        };

        self.strip_for(equip.as_ref(), activator.as_ref())
    }
}

pub struct StripFix {
    stripper: Arc<Stripper>,
    token: Option<Token>,
}

impl StripFix {
    pub fn new(stripper: Arc<Stripper>) -> StripFix {
        StripFix {
            stripper,
            token: None,
        }
    }
}

impl Fix for StripFix {
    fn name(&self) -> &str {
        "StripFix"
    }

    fn install(&mut self, context: &Context) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }

        let function = context
            .resolver()
            .by_vtable::<equip_use::Function>(USE)
            .map_err(|err| FixError::fatal(self.name(), err))?;

        let stripper = self.stripper.clone();
        let host = context.host.clone();
        let memory = context.memory.clone();

        let token = context
            .interceptor
            .install(&function, equip_use::detour(), move |next| {
                Box::new(move |(equip, input)| {
                    if let Err(err) = stripper.on_use(&*host, &*memory, equip, input) {
                        log::error!("Error stripping on use of {equip:#x}: {err:?}");
                    }

                    next.call((equip, input))
                })
            })?;

        self.token = Some(token);
        Ok(())
    }

    fn uninstall(&mut self, context: &Context) {
        hook::remove_token(&context.interceptor, &mut self.token);
    }
}
