//! Finds functions in the server binary, either by scanning for a byte signature or by reading a
//! slot out of a class's virtual table.

use std::{fmt, str::FromStr};

use eyre::Result;
use itertools::Itertools;

use crate::{
    error::FixError,
    hook::Signature,
    host::Memory,
    meta::game_data::GameData,
};

/// Module that every vtable we use lives in.
const SERVER_MODULE: &str = "server";

/// A byte pattern where some bytes may be anything.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pattern(Vec<Option<u8>>);

impl Pattern {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn matches(&self, window: &[u8]) -> bool {
        self.0
            .iter()
            .zip(window)
            .all(|(expected, actual)| expected.map_or(true, |expected| expected == *actual))
    }

    /// Returns the offsets of up to `limit` matches in `bytes`.
    pub fn find(&self, bytes: &[u8], limit: usize) -> Vec<usize> {
        if self.is_empty() || bytes.len() < self.len() {
            return vec![];
        }

        bytes
            .windows(self.len())
            .enumerate()
            .filter(|(_, window)| self.matches(window))
            .map(|(offset, _)| offset)
            .take(limit)
            .collect()
    }

    /// Returns the bytes, or `None` if the pattern has wildcards.
    pub fn exact_bytes(&self) -> Option<Vec<u8>> {
        self.0.iter().copied().collect()
    }
}

impl FromStr for Pattern {
    type Err = String;

    /// Parses space-separated hex bytes, with `?` or `??` for wildcards.
    fn from_str(s: &str) -> Result<Pattern, String> {
        let bytes = s
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(None),
                hex => u8::from_str_radix(hex, 16)
                    .map(Some)
                    .map_err(|_| format!("bad byte '{hex}'")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if bytes.is_empty() {
            return Err("empty pattern".to_string());
        }

        Ok(Pattern(bytes))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .0
            .iter()
            .map(|byte| match byte {
                Some(byte) => format!("{byte:02X}"),
                None => "?".to_string(),
            })
            .join(" ");

        f.write_str(&text)
    }
}

/// A virtual method, named by its class and the game-data offset that gives its slot index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MethodSlot {
    pub class: &'static str,
    pub method: &'static str,
}

impl MethodSlot {
    pub const fn new(class: &'static str, method: &'static str) -> MethodSlot {
        MethodSlot { class, method }
    }
}

impl fmt::Display for MethodSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.method, self.class)
    }
}

/// A function in the server that we can call or divert.
pub struct ForeignFn<S> {
    name: String,
    address: usize,
    entry: S,
}

impl<S: Signature> ForeignFn<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the function lives in the module image.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn call(&self, args: S::Args) -> S::Ret {
        self.entry.invoke(args)
    }
}

impl<S> fmt::Debug for ForeignFn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x}", self.name, self.address)
    }
}

pub struct Resolver<'a> {
    game_data: &'a GameData,
    memory: &'a dyn Memory,
}

impl<'a> Resolver<'a> {
    pub fn new(game_data: &'a GameData, memory: &'a dyn Memory) -> Resolver<'a> {
        Resolver { game_data, memory }
    }

    /// Returns the address of the single place in its module that the signature `name` matches.
    pub fn scan(&self, name: &str) -> Result<usize> {
        let fail = |reason: String| FixError::resolution(name, reason);

        let (module, pattern) = self
            .game_data
            .signature(name)
            .ok_or_else(|| fail("no signature for this platform".to_string()))?;

        let pattern: Pattern = pattern.parse().map_err(fail)?;

        let image = self
            .memory
            .module(module)
            .ok_or_else(|| fail(format!("module '{module}' is not loaded")))?;

        match pattern.find(image.bytes, 2).as_slice() {
            [offset] => Ok(image.base + offset),
            [] => Err(fail(format!("'{pattern}' not found in '{module}'")).into()),
            _ => Err(fail(format!("'{pattern}' matches more than once in '{module}'")).into()),
        }
    }

    /// Finds the function whose signature is called `name`.
    pub fn by_signature<S: Signature>(&self, name: &str) -> Result<ForeignFn<S>> {
        let address = self.scan(name)?;
        Ok(self.foreign_fn(name.to_string(), address))
    }

    /// Finds the virtual method in `slot`.
    pub fn by_vtable<S: Signature>(&self, slot: MethodSlot) -> Result<ForeignFn<S>> {
        let name = slot.to_string();
        let fail = |reason: String| FixError::resolution(name.clone(), reason);

        let vtable = self
            .memory
            .vtable(SERVER_MODULE, slot.class)
            .ok_or_else(|| fail(format!("no vtable for '{}'", slot.class)))?;

        let index = self
            .game_data
            .offset(slot.method)
            .ok_or_else(|| fail("no offset for this platform".to_string()))?;

        let entry_address = vtable + index * std::mem::size_of::<usize>();

        let address = self
            .memory
            .read_usize(entry_address)
            .filter(|address| *address != 0)
            .ok_or_else(|| fail(format!("vtable entry {index} is unreadable")))?;

        Ok(self.foreign_fn(name, address))
    }

    fn foreign_fn<S: Signature>(&self, name: String, address: usize) -> ForeignFn<S> {
        log::debug!("Resolved '{name}' to {address:#x}.");

        ForeignFn {
            entry: unsafe { S::from_address(self.memory.code_address(address)) },
            name,
            address,
        }
    }
}
