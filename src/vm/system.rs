/// Battle system facade
///
/// The control surface hosts talk to: load bots from assembly source, start
/// and drive the battle, inspect snapshots and subscribe to events. Each
/// `BattleSystem` owns one battle; hosts may instantiate many independently,
/// nothing is shared between them.
use crate::assembler::Assembler;
use crate::error::Result;
use crate::vm::battle::{BattleConfig, BattleController, BattleState, BattleStats, BattleStatus};
use crate::vm::event::{BattleEvent, EventSink};
use crate::vm::process::ProcessId;
use log::info;
use std::path::Path;

/// Load-order index of a bot within a battle
pub type BotId = usize;

/// Facade over one battle and the assembler that feeds it
pub struct BattleSystem {
    assembler: Assembler,
    controller: BattleController,
}

impl BattleSystem {
    /// Create a battle system with battle id 1
    pub fn new(config: BattleConfig) -> Result<Self> {
        Self::with_id(1, config)
    }

    /// Create a battle system with an explicit battle id
    pub fn with_id(id: u64, config: BattleConfig) -> Result<Self> {
        Ok(Self {
            assembler: Assembler::new(),
            controller: BattleController::new(id, config)?,
        })
    }

    /// Assemble `source` and place the bot into the arena
    ///
    /// A `.name` directive in the source wins over the host-provided name.
    pub fn load_bot(&mut self, name: &str, source: &str) -> Result<BotId> {
        let mut image = self.assembler.assemble_source(source)?;
        if image.name.is_empty() {
            image.name = name.to_string();
        }
        info!("assembled bot '{}' ({} bytes)", image.name, image.size());
        self.controller.load_image(image)?;
        Ok(self.controller.bots().len() - 1)
    }

    /// Assemble a `.asm` file and place the bot into the arena
    pub fn load_bot_file<P: AsRef<Path>>(&mut self, path: P) -> Result<BotId> {
        let image = self.assembler.assemble_file(path)?;
        info!("assembled bot '{}' ({} bytes)", image.name, image.size());
        self.controller.load_image(image)?;
        Ok(self.controller.bots().len() - 1)
    }

    /// Start running turns
    pub fn start(&mut self) -> Result<()> {
        self.controller.start()
    }

    /// Suspend turn processing
    pub fn pause(&mut self) {
        self.controller.pause();
    }

    /// Resume a paused battle
    pub fn resume(&mut self) {
        self.controller.resume();
    }

    /// End the battle with no winner at the next boundary
    pub fn abort(&mut self) {
        self.controller.abort();
    }

    /// Reinitialize and re-place all bots at fresh random bases
    pub fn reset(&mut self, preserve_access_log: bool) -> Result<()> {
        self.controller.reset(preserve_access_log)
    }

    /// Run up to `n` turns
    pub fn run_turns(&mut self, n: u64) -> Result<BattleStatus> {
        self.controller.run_turns(n)
    }

    /// Run until completion and return the winning process, if any
    pub fn run_to_completion(&mut self) -> Result<Option<ProcessId>> {
        self.controller.run_to_completion()
    }

    /// Read-only snapshot of the battle
    pub fn snapshot(&self) -> BattleState {
        self.controller.snapshot()
    }

    /// Accounting summary
    pub fn stats(&self) -> BattleStats {
        self.controller.stats()
    }

    /// Register an event observer
    pub fn subscribe_events(&mut self, sink: Box<dyn EventSink>) {
        self.controller.subscribe(sink);
    }

    /// The event stream so far
    pub fn events(&self) -> &[BattleEvent] {
        self.controller.events()
    }

    /// The underlying battle, for diagnostics and host integrations
    pub fn controller(&self) -> &BattleController {
        &self.controller
    }

    /// Mutable access to the underlying battle
    pub fn controller_mut(&mut self) -> &mut BattleController {
        &mut self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArenaError;

    fn config() -> BattleConfig {
        BattleConfig {
            memory_size: 4096,
            max_turns: 50,
            cycles_per_turn: 10,
            seed: 11,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_and_run() {
        let mut system = BattleSystem::new(config()).unwrap();
        let a = system.load_bot("spinner", "spin: jmp spin\n").unwrap();
        let b = system.load_bot("quitter", "hlt\n").unwrap();
        assert_eq!((a, b), (0, 1));

        let winner = system.run_to_completion().unwrap();
        assert!(winner.is_some());
        let snapshot = system.snapshot();
        assert_eq!(snapshot.status, BattleStatus::Completed);
        assert_eq!(snapshot.alive_per_bot.get("spinner"), Some(&1));
        assert_eq!(snapshot.alive_per_bot.get("quitter"), Some(&0));
    }

    #[test]
    fn test_name_directive_wins() {
        let mut system = BattleSystem::new(config()).unwrap();
        system
            .load_bot("fallback", ".name \"real\"\nhlt\n")
            .unwrap();
        assert_eq!(system.controller().bots()[0].name, "real");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut system = BattleSystem::new(config()).unwrap();
        system.load_bot("twin", "hlt\n").unwrap();
        let err = system.load_bot("twin", "nop\nhlt\n").unwrap_err();
        assert!(matches!(err, ArenaError::InvalidConfig { .. }));
    }

    #[test]
    fn test_assembly_error_bubbles_up() {
        let mut system = BattleSystem::new(config()).unwrap();
        let err = system.load_bot("broken", "jmp nowhere\n").unwrap_err();
        assert!(matches!(err, ArenaError::UndefinedSymbol { .. }));
        // a failed load leaves no bot behind
        assert!(system.controller().bots().is_empty());
    }

    #[test]
    fn test_load_bot_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".asm").unwrap();
        writeln!(file, "spin: jmp spin").unwrap();
        file.flush().unwrap();

        let mut system = BattleSystem::new(config()).unwrap();
        system.load_bot_file(file.path()).unwrap();
        // default name comes from the file stem
        assert!(!system.controller().bots()[0].name.is_empty());
    }
}
