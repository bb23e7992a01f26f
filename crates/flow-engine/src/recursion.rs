//! Static recursion analysis over declared tail calls
//!
//! Task bodies are opaque closures, so each [`TaskDef`] declares the tasks it
//! may return as a tail call. The analyzer keeps the call graph of every task
//! it has seen and groups tasks into recursive cycles (strongly connected
//! components with more than one task, or a task that calls itself).

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::call::TaskDef;

#[derive(Default)]
struct AnalyzerState {
    calls: BTreeMap<String, Vec<String>>,
    cycles: HashMap<String, usize>,
}

/// Groups observed tasks into recursive cycles
#[derive(Default)]
pub struct RecursionAnalyzer {
    state: RwLock<AnalyzerState>,
}

impl RecursionAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task's declared calls; returns true if the task was new
    pub fn observe(&self, task: &TaskDef) -> bool {
        if self.state.read().calls.contains_key(task.name()) {
            return false;
        }
        let mut state = self.state.write();
        if state.calls.contains_key(task.name()) {
            return false;
        }
        state
            .calls
            .insert(task.name().to_string(), task.tail_calls().to_vec());
        let cycles = find_cycles(&state.calls);
        state.cycles = cycles;
        true
    }

    /// Cycle id of a task, if it is part of a recursive cycle
    pub fn cycle_of(&self, name: &str) -> Option<usize> {
        self.state.read().cycles.get(name).copied()
    }

    /// Whether `caller` declares a tail call to `callee`
    pub fn declares(&self, caller: &str, callee: &str) -> bool {
        self.state
            .read()
            .calls
            .get(caller)
            .is_some_and(|calls| calls.iter().any(|c| c == callee))
    }
}

/// Tarjan's strongly connected components, keeping only recursive ones
fn find_cycles(calls: &BTreeMap<String, Vec<String>>) -> HashMap<String, usize> {
    struct Tarjan<'a> {
        calls: &'a BTreeMap<String, Vec<String>>,
        index: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        on_stack: HashMap<&'a str, bool>,
        stack: Vec<&'a str>,
        next: usize,
        cycles: HashMap<String, usize>,
        next_cycle: usize,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, name: &'a str) {
            self.index.insert(name, self.next);
            self.lowlink.insert(name, self.next);
            self.next += 1;
            self.stack.push(name);
            self.on_stack.insert(name, true);

            let calls: &'a BTreeMap<String, Vec<String>> = self.calls;
            let callees = calls.get(name).map(Vec::as_slice).unwrap_or_default();
            for callee in callees {
                let callee = callee.as_str();
                if !self.index.contains_key(callee) {
                    self.visit(callee);
                    let low = self.lowlink[name].min(self.lowlink[callee]);
                    self.lowlink.insert(name, low);
                } else if self.on_stack.get(callee).copied().unwrap_or(false) {
                    let low = self.lowlink[name].min(self.index[callee]);
                    self.lowlink.insert(name, low);
                }
            }

            if self.lowlink[name] == self.index[name] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.insert(member, false);
                    component.push(member);
                    if member == name {
                        break;
                    }
                }
                let self_loop = self
                    .calls
                    .get(name)
                    .is_some_and(|c| c.iter().any(|callee| callee == name));
                if component.len() > 1 || self_loop {
                    for member in component {
                        self.cycles.insert(member.to_string(), self.next_cycle);
                    }
                    self.next_cycle += 1;
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        calls,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashMap::new(),
        stack: Vec::new(),
        next: 0,
        cycles: HashMap::new(),
        next_cycle: 0,
    };
    for name in calls.keys() {
        if !tarjan.index.contains_key(name.as_str()) {
            tarjan.visit(name);
        }
    }
    tarjan.cycles
}
