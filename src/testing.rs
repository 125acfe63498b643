//! Stand-ins for the server process: a synthetic server module, native functions that record
//! their calls, and a host with mock entities.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use byteorder::{ByteOrder, LittleEndian};
use eyre::Result;
use itertools::Itertools;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::FixError,
    game::{
        entity::{
            Collision, Entity, MoveType, SceneNode, SolidType, SubtickMove, UserCmd, Weapon,
            PLAYER_DESIGNER_NAME,
        },
        Context,
    },
    hook::{Interceptor, Patcher, Signature},
    host::{Host, Memory, ModuleImage},
    math::Vector,
    meta::{
        game_data::{GameData, PatchEntry, PerPlatform, SignatureEntry},
        settings::{Options, Switches},
    },
    resolver::MethodSlot,
};

const IMAGE_BASE: usize = 0x1000_0000;
const VTABLE_BASE: usize = 0x2000_0000;
const VIRTUAL_BASE: usize = 0x3000_0000;
const DATA_BASE: usize = 0x4000_0000;

/// Filler between the functions in the synthetic image.
const PADDING: [u8; 8] = [0x90; 8];

fn both<T: Clone>(value: T) -> PerPlatform<T> {
    PerPlatform {
        linux: Some(value.clone()),
        windows: Some(value),
    }
}

#[derive(Default)]
struct PatchState {
    attached: HashMap<usize, usize>,
    attach_counts: HashMap<usize, usize>,
}

/// A fake server module. Functions added to it get a unique signature and a fake address that
/// maps to a real function, so resolving and calling through works as it would in the game.
#[derive(Default)]
pub struct MockBinary {
    image: Vec<u8>,
    signatures: HashMap<String, String>,
    offsets: HashMap<String, usize>,
    patches: HashMap<String, PatchEntry>,
    code: HashMap<usize, usize>,
    vtables: HashMap<String, usize>,
    next_virtual: usize,
    next_data: AtomicUsize,
    memory: Mutex<HashMap<usize, u8>>,
    patch_state: Mutex<PatchState>,
}

impl MockBinary {
    pub fn new() -> MockBinary {
        MockBinary {
            next_virtual: VIRTUAL_BASE,
            next_data: AtomicUsize::new(DATA_BASE),
            ..Default::default()
        }
    }

    /// Appends `bytes` to the image and returns the address they start at.
    pub fn append_image(&mut self, bytes: &[u8]) -> usize {
        let address = IMAGE_BASE + self.image.len();

        self.image.extend_from_slice(bytes);
        self.image.extend_from_slice(&PADDING);

        address
    }

    /// Registers a signature without putting anything matching it in the image.
    pub fn add_raw_signature(&mut self, name: &str, bytes: &[u8]) {
        let pattern = bytes.iter().map(|byte| format!("{byte:02X}")).join(" ");
        self.signatures.insert(name.to_string(), pattern);
    }

    /// Adds a function that the signature `name` finds. Calls to the returned address run `real`.
    pub fn add_function(&mut self, name: &str, real: usize) -> usize {
        let mut bytes = [0xCC, 0x5A, 0, 0, 0, 0, 0x5A, 0xCC];
        LittleEndian::write_u32(&mut bytes[2..6], self.signatures.len() as u32 + 1);

        let address = self.append_image(&bytes);

        self.add_raw_signature(name, &bytes);
        self.code.insert(address, real);

        address
    }

    /// Puts `real` in the vtable of `slot.class` at `index`, and sets the offset for
    /// `slot.method` to `index`.
    pub fn add_virtual(&mut self, slot: MethodSlot, index: usize, real: usize) -> usize {
        let existing = self.offsets.insert(slot.method.to_string(), index);
        assert!(
            existing.map_or(true, |existing| existing == index),
            "offset for {} redefined",
            slot.method
        );

        let vtable = self.vtable_address(slot.class);

        let address = self.next_virtual;
        self.next_virtual += 0x10;
        self.code.insert(address, real);

        self.write_usize(vtable + index * std::mem::size_of::<usize>(), address);

        address
    }

    /// Returns the vtable address for `class`, creating an empty one if needed.
    pub fn vtable_address(&mut self, class: &str) -> usize {
        let count = self.vtables.len();

        *self
            .vtables
            .entry(class.to_string())
            .or_insert(VTABLE_BASE + count * 0x1000)
    }

    pub fn set_offset(&mut self, name: &str, index: usize) {
        self.offsets.insert(name.to_string(), index);
    }

    /// Adds a game-data patch that writes `bytes` at `offset` from the match of `signature`.
    pub fn add_patch(&mut self, name: &str, signature: &str, offset: isize, bytes: &str) {
        self.patches.insert(
            name.to_string(),
            PatchEntry {
                signature: signature.to_string(),
                offset: both(offset),
                bytes: both(bytes.to_string()),
            },
        );
    }

    /// Reserves `len` zeroed bytes of data memory.
    pub fn alloc(&self, len: usize) -> usize {
        let address = self
            .next_data
            .fetch_add((len + 0xF) & !0xF, Ordering::Relaxed);

        let mut memory = self.memory.lock();
        for offset in 0..len {
            memory.insert(address + offset, 0);
        }

        address
    }

    pub fn add_c_str(&self, text: &str) -> usize {
        let address = self.alloc(text.len() + 1);
        self.write_raw(address, text.as_bytes());
        address
    }

    pub fn write_usize(&self, address: usize, value: usize) {
        let mut bytes = [0; 8];
        LittleEndian::write_u64(&mut bytes, value as u64);
        self.write_raw(address, &bytes);
    }

    pub fn write_i32(&self, address: usize, value: i32) {
        let mut bytes = [0; 4];
        LittleEndian::write_i32(&mut bytes, value);
        self.write_raw(address, &bytes);
    }

    fn write_raw(&self, address: usize, bytes: &[u8]) {
        let mut memory = self.memory.lock();

        for (offset, byte) in bytes.iter().enumerate() {
            memory.insert(address + offset, *byte);
        }
    }

    fn read_byte(&self, address: usize) -> Option<u8> {
        if let Some(byte) = self.memory.lock().get(&address) {
            return Some(*byte);
        }

        address
            .checked_sub(IMAGE_BASE)
            .and_then(|offset| self.image.get(offset))
            .copied()
    }

    /// Game data describing everything added to the binary.
    pub fn game_data(&self) -> GameData {
        GameData {
            signatures: self
                .signatures
                .iter()
                .map(|(name, pattern)| {
                    let entry = SignatureEntry {
                        library: "server".to_string(),
                        patterns: both(pattern.clone()),
                    };

                    (name.clone(), entry)
                })
                .collect(),

            offsets: self
                .offsets
                .iter()
                .map(|(name, index)| (name.clone(), both(*index)))
                .collect(),

            patches: self.patches.clone(),
        }
    }

    pub fn is_attached(&self, target: usize) -> bool {
        self.patch_state.lock().attached.contains_key(&target)
    }

    /// How many times `target` has been attached to, including attaches since undone.
    pub fn attach_count(&self, target: usize) -> usize {
        self.patch_state
            .lock()
            .attach_counts
            .get(&target)
            .copied()
            .unwrap_or(0)
    }

    /// The entry point that native calls to `target` currently jump to.
    pub fn detour_of(&self, target: usize) -> Option<usize> {
        self.patch_state.lock().attached.get(&target).copied()
    }
}

impl Memory for MockBinary {
    fn module(&self, name: &str) -> Option<ModuleImage<'_>> {
        (name == "server").then(|| ModuleImage {
            base: IMAGE_BASE,
            bytes: &self.image,
        })
    }

    fn vtable(&self, module: &str, class: &str) -> Option<usize> {
        if module != "server" {
            return None;
        }

        self.vtables.get(class).copied()
    }

    fn read_usize(&self, address: usize) -> Option<usize> {
        self.read_bytes(address, 8)
            .map(|bytes| LittleEndian::read_u64(&bytes) as usize)
    }

    fn read_i32(&self, address: usize) -> Option<i32> {
        self.read_bytes(address, 4)
            .map(|bytes| LittleEndian::read_i32(&bytes))
    }

    fn read_c_str(&self, address: usize) -> Option<String> {
        let mut bytes = vec![];

        for offset in 0.. {
            match self.read_byte(address + offset)? {
                0 => break,
                byte => bytes.push(byte),
            }
        }

        String::from_utf8(bytes).ok()
    }

    fn read_bytes(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        (0..len)
            .map(|offset| self.read_byte(address + offset))
            .collect()
    }

    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        if self.read_bytes(address, bytes.len()).is_none() {
            return Err(eyre::format_err!("{address:#x} is not mapped"));
        }

        self.write_raw(address, bytes);
        Ok(())
    }

    fn code_address(&self, address: usize) -> usize {
        self.code.get(&address).copied().unwrap_or(address)
    }
}

impl Patcher for MockBinary {
    fn attach(&self, target: usize, detour: usize, trampoline: &AtomicUsize) -> Result<()> {
        let real = self
            .code
            .get(&target)
            .copied()
            .ok_or_else(|| eyre::format_err!("no code at {target:#x}"))?;

        let mut state = self.patch_state.lock();

        if state.attached.contains_key(&target) {
            return Err(eyre::format_err!("{target:#x} is already patched"));
        }

        trampoline.store(real, Ordering::Release);

        state.attached.insert(target, detour);
        *state.attach_counts.entry(target).or_default() += 1;

        Ok(())
    }

    fn detach(&self, target: usize) -> Result<()> {
        self.patch_state
            .lock()
            .attached
            .remove(&target)
            .map(|_| ())
            .ok_or_else(|| eyre::format_err!("{target:#x} is not patched"))
    }
}

/// Makes a call the way the engine would: through whatever is diverting `target`, or straight
/// to the function if nothing is.
pub fn engine_call<S: Signature>(
    interceptor: &Interceptor,
    binary: &MockBinary,
    target: usize,
    args: S::Args,
) -> S::Ret
where
    S::Ret: Send,
{
    match interceptor.hook_at::<S::Args, S::Ret>(target) {
        Some(hook) => hook.call(args),
        None => unsafe { S::from_address(binary.code_address(target)) }.invoke(args),
    }
}

thread_local! {
    static CALLS: RefCell<Vec<(&'static str, Vec<usize>)>> = RefCell::new(vec![]);
    static FILTER_RESULT: RefCell<bool> = RefCell::new(true);
}

pub fn record(name: &'static str, args: Vec<usize>) {
    CALLS.with(|calls| calls.borrow_mut().push((name, args)));
}

/// The arguments of every recorded call to `name` on this thread.
pub fn calls(name: &str) -> Vec<Vec<usize>> {
    CALLS.with(|calls| {
        calls
            .borrow()
            .iter()
            .filter(|(called, _)| *called == name)
            .map(|(_, args)| args.clone())
            .collect()
    })
}

pub fn reset_calls() {
    CALLS.with(|calls| calls.borrow_mut().clear());
    FILTER_RESULT.with(|result| *result.borrow_mut() = true);
}

/// Sets what `original_passes_filters` returns on this thread.
pub fn set_filter_result(passes: bool) {
    FILTER_RESULT.with(|result| *result.borrow_mut() = passes);
}

macro_rules! recording_functions {
    ($($name:ident),*) => {
        $(
            pub extern "C" fn $name(entity: usize, other: usize) {
                record(stringify!($name), vec![entity, other]);
            }
        )*
    };
}

recording_functions!(
    original_touch,
    original_use,
    original_all_players,
    original_activated_player,
    original_push_touch,
    original_gravity_touch,
    original_precache,
    original_end_touch
);

pub extern "C" fn original_set_gravity_scale(entity: usize, scale: f32) {
    record(
        "original_set_gravity_scale",
        vec![entity, scale.to_bits() as usize],
    );
}

pub extern "C" fn original_passes_filters(trigger: usize, other: usize) -> bool {
    record("original_passes_filters", vec![trigger, other]);
    FILTER_RESULT.with(|result| *result.borrow())
}

pub extern "C" fn original_process_usercmds(
    controller: usize,
    commands: usize,
    count: i32,
    paused: bool,
    _margin: f32,
) -> usize {
    record(
        "original_process_usercmds",
        vec![controller, commands, count as usize, paused as usize],
    );

    0
}

/// Everything about a mock entity that tests set up or inspect.
#[derive(Clone, Debug)]
pub struct EntityState {
    pub removed: bool,
    pub unique_id: Option<String>,
    pub spawn_flags: u32,
    pub alive: bool,
    pub move_type: MoveType,
    pub collision: Option<Collision>,
    pub scene_node: Option<SceneNode>,
    pub flags: u32,
    pub base_velocity: Vector,
    pub ground_cleared: bool,
    pub teleported_to: Option<Vector>,
    pub trigger_on_start_touch: bool,
    pub push_direction: Vector,
    pub push_speed: f32,
    pub gravity_scale: f32,
    pub actual_gravity_scale: Option<f32>,
    pub weapons: Vec<Arc<MockWeapon>>,
    pub dropped: Vec<usize>,
    pub items_removed: usize,
    pub given: Vec<String>,
}

impl Default for EntityState {
    fn default() -> Self {
        EntityState {
            removed: false,
            unique_id: None,
            spawn_flags: 0,
            alive: false,
            move_type: MoveType::Walk,
            collision: Some(Collision {
                solid_type: SolidType::Bbox,
                solid_flags: 0,
            }),
            scene_node: Some(SceneNode::default()),
            flags: 0,
            base_velocity: Vector::default(),
            ground_cleared: false,
            teleported_to: None,
            trigger_on_start_touch: false,
            push_direction: Vector::default(),
            push_speed: 0.0,
            gravity_scale: 1.0,
            actual_gravity_scale: None,
            weapons: vec![],
            dropped: vec![],
            items_removed: 0,
            given: vec![],
        }
    }
}

pub struct MockEntity {
    address: usize,
    designer_name: String,
    state: Mutex<EntityState>,
}

impl MockEntity {
    pub fn new(address: usize, designer_name: &str) -> MockEntity {
        MockEntity {
            address,
            designer_name: designer_name.to_string(),
            state: Mutex::new(EntityState::default()),
        }
    }

    /// A live player pawn.
    pub fn pawn(address: usize) -> MockEntity {
        let pawn = MockEntity::new(address, PLAYER_DESIGNER_NAME);
        pawn.state().alive = true;
        pawn
    }

    pub fn with_id(self, id: &str) -> MockEntity {
        self.state().unique_id = Some(id.to_string());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock()
    }

    fn live(&self) -> Result<MutexGuard<'_, EntityState>> {
        let state = self.state.lock();

        if state.removed {
            return Err(FixError::TransientState {
                address: self.address,
            }
            .into());
        }

        Ok(state)
    }
}

impl Entity for MockEntity {
    fn address(&self) -> usize {
        self.address
    }

    fn is_valid(&self) -> bool {
        !self.state.lock().removed
    }

    fn designer_name(&self) -> Result<String> {
        self.live()?;
        Ok(self.designer_name.clone())
    }

    fn unique_id(&self) -> Result<Option<String>> {
        Ok(self.live()?.unique_id.clone())
    }

    fn spawn_flags(&self) -> Result<u32> {
        Ok(self.live()?.spawn_flags)
    }

    fn is_alive(&self) -> Result<bool> {
        Ok(self.live()?.alive)
    }

    fn move_type(&self) -> Result<MoveType> {
        Ok(self.live()?.move_type)
    }

    fn collision(&self) -> Result<Option<Collision>> {
        Ok(self.live()?.collision)
    }

    fn scene_node(&self) -> Result<Option<SceneNode>> {
        Ok(self.live()?.scene_node)
    }

    fn flags(&self) -> Result<u32> {
        Ok(self.live()?.flags)
    }

    fn set_flags(&self, flags: u32) -> Result<()> {
        self.live()?.flags = flags;
        Ok(())
    }

    fn base_velocity(&self) -> Result<Vector> {
        Ok(self.live()?.base_velocity)
    }

    fn set_base_velocity(&self, velocity: Vector) -> Result<()> {
        self.live()?.base_velocity = velocity;
        Ok(())
    }

    fn clear_ground_entity(&self) -> Result<()> {
        self.live()?.ground_cleared = true;
        Ok(())
    }

    fn teleport(&self, origin: Vector) -> Result<()> {
        let mut state = self.live()?;

        state.teleported_to = Some(origin);
        if let Some(node) = state.scene_node.as_mut() {
            node.abs_origin = origin;
        }

        Ok(())
    }

    fn trigger_on_start_touch(&self) -> Result<bool> {
        Ok(self.live()?.trigger_on_start_touch)
    }

    fn push_direction(&self) -> Result<Vector> {
        Ok(self.live()?.push_direction)
    }

    fn push_speed(&self) -> Result<f32> {
        Ok(self.live()?.push_speed)
    }

    fn gravity_scale(&self) -> Result<f32> {
        Ok(self.live()?.gravity_scale)
    }

    fn set_actual_gravity_scale(&self, scale: f32) -> Result<()> {
        self.live()?.actual_gravity_scale = Some(scale);
        Ok(())
    }

    fn weapons(&self) -> Result<Vec<Arc<dyn Weapon>>> {
        Ok(self
            .live()?
            .weapons
            .iter()
            .map(|weapon| weapon.clone() as Arc<dyn Weapon>)
            .collect())
    }

    fn drop_weapon(&self, weapon: &dyn Weapon) -> Result<()> {
        let mut state = self.live()?;

        state.dropped.push(weapon.address());
        state
            .weapons
            .retain(|owned| owned.address() != weapon.address());

        Ok(())
    }

    fn remove_items(&self) -> Result<()> {
        let mut state = self.live()?;

        state.items_removed += 1;
        state.weapons.clear();

        Ok(())
    }

    fn give_item(&self, name: &str) -> Result<()> {
        self.live()?.given.push(name.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockWeapon {
    address: usize,
    slot: u32,
    spawns: AtomicUsize,
}

impl MockWeapon {
    pub fn new(address: usize, slot: u32) -> Arc<MockWeapon> {
        Arc::new(MockWeapon {
            address,
            slot,
            spawns: AtomicUsize::new(0),
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Weapon for MockWeapon {
    fn address(&self) -> usize {
        self.address
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn slot(&self) -> Result<u32> {
        Ok(self.slot)
    }

    fn dispatch_spawn(&self) -> Result<()> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The subtick-related contents of a mock user command.
#[derive(Clone, Debug, Default)]
pub struct MockCmd {
    pub moves: Vec<SubtickMove>,
    pub attack_indices: (i32, i32),
    pub input_history: Vec<u32>,

    /// How many times the subtick moves were rewritten.
    pub rebuilds: usize,
}

struct MockCmdView(Arc<Mutex<MockCmd>>);

impl UserCmd for MockCmdView {
    fn subtick_moves(&self) -> Vec<SubtickMove> {
        self.0.lock().moves.clone()
    }

    fn set_subtick_moves(&mut self, moves: Vec<SubtickMove>) {
        let mut cmd = self.0.lock();
        cmd.moves = moves;
        cmd.rebuilds += 1;
    }

    fn attack_start_history_indices(&self) -> (i32, i32) {
        self.0.lock().attack_indices
    }

    fn set_attack_start_history_indices(&mut self, primary: i32, secondary: i32) {
        self.0.lock().attack_indices = (primary, secondary);
    }

    fn input_history_len(&self) -> usize {
        self.0.lock().input_history.len()
    }

    fn clear_input_history(&mut self) {
        self.0.lock().input_history.clear();
    }
}

/// A host with a fixed set of entities and a manually-run world update.
#[derive(Default)]
pub struct MockHost {
    entities: Mutex<HashMap<usize, Arc<MockEntity>>>,
    players: Mutex<Vec<usize>>,
    scheduled: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    commands: Mutex<HashMap<usize, Vec<Arc<Mutex<MockCmd>>>>>,
}

impl MockHost {
    pub fn new() -> Arc<MockHost> {
        Arc::new(MockHost::default())
    }

    pub fn add(&self, entity: MockEntity) -> Arc<MockEntity> {
        let entity = Arc::new(entity);
        self.entities
            .lock()
            .insert(entity.address(), entity.clone());

        entity
    }

    /// Adds `pawn` and lists it as a connected player.
    pub fn add_player(&self, pawn: MockEntity) -> Arc<MockEntity> {
        self.players.lock().push(pawn.address());
        self.add(pawn)
    }

    /// Destroys the entity at `address`. Views that are still held start failing.
    pub fn remove(&self, address: usize) {
        if let Some(entity) = self.entities.lock().remove(&address) {
            entity.state().removed = true;
        }
    }

    /// Runs everything scheduled for the next world update. Returns how many tasks ran.
    pub fn run_world_update(&self) -> usize {
        let tasks: Vec<_> = self.scheduled.lock().drain(..).collect();
        let count = tasks.len();

        for task in tasks {
            task();
        }

        count
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub fn add_user_cmds(&self, commands: usize, cmds: Vec<MockCmd>) {
        self.commands.lock().insert(
            commands,
            cmds.into_iter()
                .map(|cmd| Arc::new(Mutex::new(cmd)))
                .collect(),
        );
    }

    pub fn user_cmd(&self, commands: usize, index: usize) -> MockCmd {
        self.commands.lock()[&commands][index].lock().clone()
    }
}

impl Host for MockHost {
    fn entity(&self, address: usize) -> Option<Arc<dyn Entity>> {
        self.entities
            .lock()
            .get(&address)
            .map(|entity| entity.clone() as Arc<dyn Entity>)
    }

    fn player_pawns(&self) -> Vec<Arc<dyn Entity>> {
        let entities = self.entities.lock();

        self.players
            .lock()
            .iter()
            .filter_map(|address| entities.get(address))
            .map(|entity| entity.clone() as Arc<dyn Entity>)
            .collect()
    }

    fn next_world_update(&self, task: Box<dyn FnOnce() + Send>) {
        self.scheduled.lock().push(task);
    }

    fn user_cmds(&self, commands: usize, count: i32) -> Vec<Box<dyn UserCmd + '_>> {
        let all = self.commands.lock();

        let cmds = match all.get(&commands) {
            Some(cmds) => cmds,
            None => return vec![],
        };

        cmds.iter()
            .take(count.max(0) as usize)
            .map(|cmd| Box::new(MockCmdView(cmd.clone())) as Box<dyn UserCmd>)
            .collect()
    }
}

/// A mock binary and host, wired into an interceptor the way the plugin wires the real ones.
pub struct Harness {
    pub binary: Arc<MockBinary>,
    pub host: Arc<MockHost>,
    pub interceptor: Arc<Interceptor>,
    game_data: Arc<GameData>,
}

impl Harness {
    pub fn new(binary: MockBinary) -> Harness {
        let binary = Arc::new(binary);

        Harness {
            game_data: Arc::new(binary.game_data()),
            interceptor: Arc::new(Interceptor::new(binary.clone())),
            host: MockHost::new(),
            binary,
        }
    }

    pub fn context(&self) -> Context {
        self.context_with(&Options::default())
    }

    /// A context whose switches start out the way `options` has them.
    pub fn context_with(&self, options: &Options) -> Context {
        Context {
            host: self.host.clone(),
            memory: self.binary.clone(),
            game_data: self.game_data.clone(),
            interceptor: self.interceptor.clone(),
            switches: Switches::from_options(options),
        }
    }

    /// Calls `target` the way the engine would.
    pub fn call<S: Signature>(&self, target: usize, args: S::Args) -> S::Ret
    where
        S::Ret: Send,
    {
        engine_call::<S>(&self.interceptor, &self.binary, target, args)
    }

    /// Writes an `InputData_t` with no value and returns its address.
    pub fn input_data(&self, activator: usize, caller: usize) -> usize {
        self.input_data_with_value(activator, caller, 0)
    }

    pub fn input_data_with_value(&self, activator: usize, caller: usize, value: usize) -> usize {
        const WORD: usize = std::mem::size_of::<usize>();

        let address = self.binary.alloc(4 * WORD);
        self.binary.write_usize(address, activator);
        self.binary.write_usize(address + WORD, caller);
        self.binary.write_usize(address + 2 * WORD, value);

        address
    }
}

/// A binary with everything every fix looks for, including the default patches. Also returns
/// the functions that get diverted when all the fixes are installed.
pub fn full_binary() -> (MockBinary, Vec<usize>) {
    use crate::game::{equip, gravity, push, strip, subtick};

    let mut binary = MockBinary::new();

    for (name, code, bytes) in [
        ("ServerMovementUnlock", [0x0F, 0x87, 0x5E, 0x01], "90 E9"),
        ("FixWaterFloorJump", [0x74, 0x0B, 0x5E, 0x02], "EB"),
    ] {
        binary.append_image(&code);

        let signature = format!("{name}Site");
        binary.add_raw_signature(&signature, &code);
        binary.add_patch(name, &signature, 0, bytes);
    }

    binary.add_virtual(
        push::PASSES_TRIGGER_FILTERS,
        12,
        original_passes_filters as usize,
    );
    binary.add_function(
        gravity::SET_GRAVITY_SCALE,
        original_set_gravity_scale as usize,
    );

    let targets = vec![
        binary.add_virtual(strip::USE, 24, original_use as usize),
        binary.add_function(push::TOUCH, original_push_touch as usize),
        binary.add_function(
            equip::TRIGGER_FOR_ALL_PLAYERS,
            original_all_players as usize,
        ),
        binary.add_function(
            equip::TRIGGER_FOR_ACTIVATED_PLAYER,
            original_activated_player as usize,
        ),
        binary.add_function(gravity::GRAVITY_TOUCH, original_gravity_touch as usize),
        binary.add_virtual(gravity::PRECACHE, 6, original_precache as usize),
        binary.add_virtual(gravity::END_TOUCH, 137, original_end_touch as usize),
        binary.add_function(
            subtick::PROCESS_USERCMDS,
            original_process_usercmds as usize,
        ),
    ];

    (binary, targets)
}
