//! # Programs resident in instrument memory
//!
//! A [`ProgramRegistry`] owns the connections to every instrument of a setup and the programs
//! written to them, in insertion order. Inserting a program finalizes it if needed and writes
//! it behind the programs already present. Sequencer memory is filled front to back, so removing
//! a program also removes every program inserted after it; those are written again right away.
//!
//! A `wait` program with one silent segment per channel is written first. [`MultiChSeq::run`]
//! selects it on the channels a running program does not use.
//!
//! ## Debug mode
//! In debug mode nothing is sent to the instruments: programs are still finalized, and
//! [`MultiChSeq::compile_payloads`] shows what would be written. Leaving debug mode writes every
//! program that has not been written yet. A registry connected in debug mode holds no
//! instruments; [`ProgramRegistry::leave_debug_mode`] opens them before writing.
//!
//! ## Aborting
//! [`ProgramRegistry::abort_handle`] returns the flag checked between the channels of every
//! write. Once raised, writes fail with [`AwgError::Aborted`] until
//! [`ProgramRegistry::clear_abort`] is called.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use awgcompiler_backend::prelude::*;

pub const WAIT_PROGRAM_NAME: &str = "wait";

pub struct ProgramRegistry {
    config: Arc<AwgConfig>,
    programs: IndexMap<String, MultiChSeq>,
    awgs: AwgHandles,
    debug_mode: bool,
    abort: Arc<AtomicBool>,
}

/// Opens one instrument: `(name, address, channels)`.
pub trait Connector:
    Fn(&str, Option<&str>, &[u8]) -> Result<Box<dyn AwgTransport>> + Sync
{
}

impl<F> Connector for F where
    F: Fn(&str, Option<&str>, &[u8]) -> Result<Box<dyn AwgTransport>> + Sync
{
}

impl ProgramRegistry {
    /// A registry on already opened instruments. The `wait` program is written unless in debug
    /// mode.
    pub fn new(config: Arc<AwgConfig>, awgs: AwgHandles, debug_mode: bool) -> Result<Self> {
        let mut registry = Self {
            config,
            programs: IndexMap::new(),
            awgs,
            debug_mode,
            abort: Arc::new(AtomicBool::new(false)),
        };
        registry.set_wait()?;
        Ok(registry)
    }

    /// Connects to every instrument of `config` in parallel, then writes the `wait` program.
    /// In debug mode no instrument is opened.
    pub fn connect(
        config: Arc<AwgConfig>,
        debug_mode: bool,
        connector: impl Connector,
    ) -> Result<Self> {
        let awgs = if debug_mode {
            tracing::info!(
                "debug mode, not connecting to awgs {:?}",
                config.channels.keys().collect::<Vec<_>>()
            );
            AwgHandles::new()
        } else {
            connect_awgs(&config, &connector)?
        };
        Self::new(config, awgs, debug_mode)
    }

    fn set_wait(&mut self) -> Result<()> {
        let wait = MultiChSeq::wait_program(self.config.clone())?;
        self.insert_program(wait)
    }

    pub fn config(&self) -> &Arc<AwgConfig> {
        &self.config
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Leaving debug mode writes all programs from the first one not yet written on.
    ///
    /// Instruments are not opened here: on a registry connected in debug mode this fails with
    /// [`AwgError::NotConnected`]. Use [`ProgramRegistry::leave_debug_mode`] in that case.
    pub fn set_debug_mode(&mut self, debug_mode: bool) -> Result<()> {
        if self.debug_mode == debug_mode {
            return Ok(());
        }
        self.debug_mode = debug_mode;
        tracing::info!("program registry set to debug mode {}", debug_mode);
        if !debug_mode {
            self.write_pending()?;
        }
        Ok(())
    }

    /// Opens the instruments of the configuration that are not connected yet, then leaves debug
    /// mode.
    pub fn leave_debug_mode(&mut self, connector: impl Connector) -> Result<()> {
        let missing: ChannelMap = self
            .config
            .channels
            .iter()
            .filter(|(name, _)| !self.awgs.contains_key(*name))
            .map(|(name, channels)| (name.clone(), channels.clone()))
            .collect();
        if !missing.is_empty() {
            let config = AwgConfig {
                channels: missing,
                ..(*self.config).clone()
            };
            let awgs = connect_awgs(&config, &connector)?;
            self.awgs.extend(awgs);
        }
        self.set_debug_mode(false)
    }

    /// Rewrites the programs from the first one that is not (fully) written on.
    pub fn write_pending(&mut self) -> Result<()> {
        if let Some(first) = self.programs.values().position(|p| !p.is_written()) {
            let keys: Vec<String> = self.programs.keys().skip(first).cloned().collect();
            self.rewrite_keys(&keys)?;
        }
        Ok(())
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn awgs(&self) -> &AwgHandles {
        &self.awgs
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.programs.keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.programs.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&MultiChSeq> {
        self.programs
            .get(key)
            .ok_or_else(|| AwgError::UnknownProgram(key.to_string()))
    }

    pub fn dl(
        &self,
        key: &str,
        channel: &ChannelId,
        row: usize,
        wave_step: usize,
    ) -> Result<&WaveStep> {
        self.get(key)?.dl(channel, row, wave_step)
    }

    /// Adds `program` under its name, replacing (and removing from memory) a program of the
    /// same name. Programs still building are finalized with the power budget enforced.
    pub fn insert(&mut self, program: MultiChSeq) -> Result<()> {
        if program.name() == WAIT_PROGRAM_NAME {
            return Err(AwgError::config(format!(
                "'{}' is reserved for the idle program",
                WAIT_PROGRAM_NAME
            )));
        }
        self.insert_program(program)
    }

    fn insert_program(&mut self, mut program: MultiChSeq) -> Result<()> {
        if program.is_written() {
            return Err(AwgError::AlreadyWritten(program.name().to_string()));
        }
        let key = program.name().to_string();
        if self.programs.contains_key(&key) {
            self.remove_program(&key)?;
        }
        if program.status() == SeqStatus::Building {
            program.finalize(false)?;
        }
        if !self.debug_mode {
            program.write_to_device_memory(&mut self.awgs, false, Some(self.abort.as_ref()))?;
        }
        tracing::info!("program '{}' added", key);
        self.programs.insert(key, program);
        Ok(())
    }

    /// Removes a program together with every program inserted after it, then writes the
    /// later ones again.
    pub fn remove(&mut self, key: &str) -> Result<MultiChSeq> {
        if key == WAIT_PROGRAM_NAME {
            return Err(AwgError::config("the idle program can not be removed"));
        }
        self.remove_program(key)
    }

    fn remove_program(&mut self, key: &str) -> Result<MultiChSeq> {
        let idx = self
            .programs
            .get_index_of(key)
            .ok_or_else(|| AwgError::UnknownProgram(key.to_string()))?;
        let keys: Vec<String> = self.programs.keys().skip(idx).cloned().collect();
        self.delete_keys_from_device_memory(&keys)?;
        let removed = self
            .programs
            .shift_remove(key)
            .ok_or_else(|| AwgError::UnknownProgram(key.to_string()))?;
        self.write_keys_to_device_memory(&keys[1..])?;
        tracing::info!("program '{}' removed", key);
        Ok(removed)
    }

    pub fn rewrite_keys(&mut self, keys: &[String]) -> Result<()> {
        self.delete_keys_from_device_memory(keys)?;
        self.write_keys_to_device_memory(keys)
    }

    /// Deletes in reverse order, so that sequencer rows are freed from the end.
    fn delete_keys_from_device_memory(&mut self, keys: &[String]) -> Result<()> {
        for key in keys.iter().rev() {
            let program = self
                .programs
                .get_mut(key)
                .ok_or_else(|| AwgError::UnknownProgram(key.clone()))?;
            if program.is_written() {
                program.delete_from_device_memory(&mut self.awgs)?;
            }
        }
        Ok(())
    }

    fn write_keys_to_device_memory(&mut self, keys: &[String]) -> Result<()> {
        if self.debug_mode {
            return Ok(());
        }
        for key in keys {
            let program = self
                .programs
                .get_mut(key)
                .ok_or_else(|| AwgError::UnknownProgram(key.clone()))?;
            program.write_to_device_memory(&mut self.awgs, false, Some(self.abort.as_ref()))?;
        }
        Ok(())
    }

    /// Plays program `key`, optionally triggering the master instrument.
    pub fn run(&mut self, key: &str, trigger: bool) -> Result<()> {
        if self.debug_mode {
            tracing::info!("debug mode, not running '{}'", key);
            return Ok(());
        }
        let program = self
            .programs
            .get(key)
            .ok_or_else(|| AwgError::UnknownProgram(key.to_string()))?;
        let wait = self
            .programs
            .get(WAIT_PROGRAM_NAME)
            .ok_or_else(|| AwgError::UnknownProgram(WAIT_PROGRAM_NAME.to_string()))?;
        program.run(&mut self.awgs, wait, trigger)
    }

    pub fn stop_awgs(&mut self) -> Result<()> {
        if self.debug_mode {
            return Ok(());
        }
        stop_awgs(&self.config, &mut self.awgs, &self.config.channels)
    }

    pub fn info(&self) -> String {
        self.programs
            .iter()
            .map(|(key, program)| format!("{}, {:?}", key, program.ch_map()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.info())
    }
}

/// Opens every instrument of `config` on its own thread.
///
/// Each instrument is stopped, gets its saved settings back if `restore_awg_settings` is set and
/// has its memories cleared. Handles are returned in configuration order.
pub fn connect_awgs(config: &AwgConfig, connector: &impl Connector) -> Result<AwgHandles> {
    let mut timer = TickTimer::new();
    let results = crossbeam::scope(|s| {
        let handles: Vec<_> = config
            .channels
            .iter()
            .map(|(name, channels)| {
                let address = config.addresses.get(name).map(String::as_str);
                let restore = config.restore_awg_settings;
                (
                    name,
                    s.spawn(move |_| open_awg(connector, name, address, channels, restore)),
                )
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, handle)| {
                let awg = handle.join().map_err(|_| {
                    AwgError::Transport(format!("connection thread of '{}' panicked", name))
                })?;
                Ok((name.clone(), awg?))
            })
            .collect::<Vec<Result<(String, Box<dyn AwgTransport>)>>>()
    })
    .map_err(|_| AwgError::Transport("connection threads panicked".to_string()))?;
    let awgs = results.into_iter().collect::<Result<AwgHandles>>()?;
    tracing::info!(
        "connected to awgs {:?} in {:.3} s",
        awgs.keys().collect::<Vec<_>>(),
        timer.tick()
    );
    Ok(awgs)
}

fn open_awg(
    connector: &impl Connector,
    name: &str,
    address: Option<&str>,
    channels: &[u8],
    restore_settings: bool,
) -> Result<Box<dyn AwgTransport>> {
    let mut awg = connector(name, address, channels)?;
    for &ch in channels {
        awg.disarm(ch)?;
    }
    if restore_settings {
        awg.restore_settings()?;
    }
    awg.clear_memories()?;
    Ok(awg)
}
