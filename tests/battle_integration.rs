use corearena::vm::{BattleEvent, BattleStatus, ProcessState, TerminationReason};
use corearena::{BattleConfig, BattleSystem};

fn config(seed: u64) -> BattleConfig {
    BattleConfig {
        memory_size: 4096,
        max_turns: 200,
        cycles_per_turn: 100,
        seed,
        ..Default::default()
    }
}

const SPINNER: &str = "\
.name \"spinner\"
spin: jmp spin
";

#[test]
fn test_fork_creates_child_and_parent_halts() {
    let mut system = BattleSystem::new(config(5)).unwrap();
    system
        .load_bot(
            "forker",
            "spl child\nhlt\nchild: jmp child\n",
        )
        .unwrap();
    system.start().unwrap();
    system.run_turns(1).unwrap();

    let snapshot = system.snapshot();
    assert_eq!(snapshot.processes.len(), 2);

    let parent = &snapshot.processes[0];
    let child = &snapshot.processes[1];
    assert_eq!(parent.id, 1);
    assert_eq!(parent.state, ProcessState::Terminated);
    assert_eq!(child.id, 2);
    assert_eq!(child.parent, Some(1));
    assert!(child.state == ProcessState::Ready);

    // the child entered at the forked target, 10 bytes past the load base
    let base = system.controller().bots()[0].base;
    assert_eq!(child.pc, base + 10);

    // only the child remains schedulable
    assert_eq!(system.controller().manager().turn_order(), vec![2]);

    let created: Vec<_> = system
        .events()
        .iter()
        .filter(|e| matches!(e, BattleEvent::ProcessCreated { .. }))
        .collect();
    assert_eq!(created.len(), 2); // initial load + fork

    let terminated: Vec<_> = system
        .events()
        .iter()
        .filter_map(|e| match e {
            BattleEvent::ProcessTerminated { pid, reason, .. } => Some((*pid, *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(terminated, vec![(1, TerminationReason::Halted)]);
}

#[test]
fn test_halted_bot_loses_and_winner_is_first_process() {
    let mut system = BattleSystem::new(config(9)).unwrap();
    let _spinner = system.load_bot("spinner", SPINNER).unwrap();
    system
        .load_bot("quitter", "nop\nnop\nhlt\n")
        .unwrap();

    let winner = system.run_to_completion().unwrap();

    // spinner loaded first, so its first process has id 1
    assert_eq!(winner, Some(1));
    let snapshot = system.snapshot();
    assert_eq!(snapshot.status, BattleStatus::Completed);
    assert_eq!(snapshot.winner, Some(1));
    assert_eq!(snapshot.alive_per_bot.get("quitter"), Some(&0));

    // the halting process left the ready structures within its turn
    let quitter = snapshot
        .processes
        .iter()
        .find(|p| p.owner_bot == "quitter")
        .unwrap();
    assert_eq!(quitter.state, ProcessState::Terminated);

    let ended: Vec<_> = system
        .events()
        .iter()
        .filter(|e| matches!(e, BattleEvent::BattleEnded { .. }))
        .collect();
    assert_eq!(ended.len(), 1);
}

#[test]
fn test_scheduling_fairness_exact_cycle_counts() {
    let mut system = BattleSystem::new(BattleConfig {
        cycles_per_turn: 100,
        max_turns: 10_000,
        seed: 21,
        ..Default::default()
    })
    .unwrap();
    system.load_bot("east", SPINNER).unwrap();
    system
        .load_bot("west", "\n.name \"west\"\nspin: jmp spin\n")
        .unwrap();
    system.start().unwrap();
    system.run_turns(10).unwrap();

    for process in system.snapshot().processes {
        assert_eq!(process.cycles_used, 1000);
    }
}

#[test]
fn test_fairness_bound_with_forked_processes() {
    let mut system = BattleSystem::new(BattleConfig {
        memory_size: 8192,
        cycles_per_turn: 50,
        max_turns: 10_000,
        seed: 2,
        ..Default::default()
    })
    .unwrap();
    // one bot splits once, the other stays single
    system
        .load_bot("splitter", "spl child\nspin: jmp spin\nchild: jmp child\n")
        .unwrap();
    system.load_bot("solo", SPINNER).unwrap();
    system.start().unwrap();
    system.run_turns(8).unwrap();

    let snapshot = system.snapshot();
    let alive: Vec<_> = snapshot
        .processes
        .iter()
        .filter(|p| p.state != ProcessState::Terminated)
        .collect();
    assert_eq!(alive.len(), 3);
    let max = alive.iter().map(|p| p.cycles_used).max().unwrap();
    let min = alive.iter().map(|p| p.cycles_used).min().unwrap();
    // every live process drains a full quantum each turn it was scheduled;
    // the child joined one turn late, so the gap stays within one quantum
    assert!(max - min <= 50, "max {} min {}", max, min);
}

#[test]
fn test_timeout_between_spinners_is_a_draw() {
    let mut system = BattleSystem::new(BattleConfig {
        max_turns: 25,
        ..config(33)
    })
    .unwrap();
    system.load_bot("east", SPINNER).unwrap();
    system
        .load_bot("west", "\n.name \"west\"\nspin: jmp spin\n")
        .unwrap();

    let winner = system.run_to_completion().unwrap();
    assert_eq!(winner, None);
    assert_eq!(system.snapshot().turn, 25);
    assert_eq!(system.snapshot().status, BattleStatus::Completed);
}

#[test]
fn test_protection_violation_terminates_attacker() {
    let mut system = BattleSystem::new(config(3)).unwrap();
    system
        .load_bot("vandal", "mov $0F00, #1\nspin: jmp spin\n")
        .unwrap();
    system.load_bot("bystander", SPINNER).unwrap();
    system.controller_mut().memory_mut().protect(0x0F00);

    let winner = system.run_to_completion().unwrap();

    // the vandal died on its first instruction; the bystander wins
    let snapshot = system.snapshot();
    let vandal = snapshot
        .processes
        .iter()
        .find(|p| p.owner_bot == "vandal")
        .unwrap();
    assert_eq!(vandal.state, ProcessState::Terminated);
    assert_eq!(winner, system.snapshot().winner);
    assert_eq!(
        snapshot.alive_per_bot.get("bystander"),
        Some(&1)
    );

    let violations: Vec<_> = system
        .events()
        .iter()
        .filter(|e| matches!(e, BattleEvent::AccessViolation { .. }))
        .collect();
    assert_eq!(violations.len(), 1);
    assert_eq!(system.controller().memory().access_log().len(), 1);
}

#[test]
fn test_event_streams_are_deterministic_across_systems() {
    let run = |seed: u64| {
        let mut system = BattleSystem::new(BattleConfig {
            max_turns: 40,
            ..config(seed)
        })
        .unwrap();
        system.load_bot("alpha", SPINNER).unwrap();
        system
            .load_bot("omega", ".name \"omega\"\nstart: inc r0\njmp start\n")
            .unwrap();
        system.run_to_completion().unwrap();
        system.events().to_vec()
    };

    let first = run(1234);
    let second = run(1234);
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_turn_coordinates_are_monotone() {
    let mut system = BattleSystem::new(BattleConfig {
        max_turns: 5,
        ..config(17)
    })
    .unwrap();
    system.load_bot("east", SPINNER).unwrap();
    system
        .load_bot("west", "\n.name \"west\"\nspin: jmp spin\n")
        .unwrap();
    system.run_to_completion().unwrap();

    let mut last_turn = 0;
    for event in system.events() {
        let turn = event.turn();
        assert!(turn >= last_turn, "turn went backwards");
        last_turn = turn;
    }
}

#[test]
fn test_ownership_marked_for_loaded_images() {
    let mut system = BattleSystem::new(config(8)).unwrap();
    system.load_bot("own", SPINNER).unwrap();
    let bot = system.controller().bots()[0].clone();
    let memory = system.controller().memory();
    for offset in 0..bot.image.size() {
        assert_eq!(memory.get_owner(bot.base as i64 + offset as i64), bot.initial_pid);
    }
}
