use std::collections::{BTreeMap, BTreeSet};

use super::parser::{Body, CallSite, Callee, Module, Statement, Suite};

/// Free functions that read a line of user input.
pub const INPUT_FUNCTIONS: &[&str] = &["input", "textinput", "numinput"];

/// Dialog methods, on any receiver, that read user input.
pub const INPUT_METHODS: &[&str] = &["textinput", "numinput"];

/// Does this call request input directly?
pub fn is_input_call(callee: &Callee) -> bool {
    match callee {
        Callee::Name(name) => INPUT_FUNCTIONS.contains(&name.as_str()),
        Callee::Method(name) => INPUT_METHODS.contains(&name.as_str()),
        Callee::Other => false,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Definition {
    /// Names this definition calls, as free functions or methods.
    pub callees: BTreeSet<String>,
    pub calls_input: bool,
}

/// Definitions keyed by name. Same-name definitions (methods of different
/// classes, redefinitions) share one node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallGraph {
    pub defs: BTreeMap<String, Definition>,
}

impl CallGraph {
    /// Fixed-point closure. Returns the suspending names and the number of
    /// rounds that marked something new.
    pub fn close(&self) -> (BTreeSet<String>, usize) {
        let mut suspending: BTreeSet<String> = self
            .defs
            .iter()
            .filter(|(_, d)| d.calls_input)
            .map(|(name, _)| name.clone())
            .collect();
        let mut rounds = 0;
        loop {
            let mut changed = false;
            for (name, def) in &self.defs {
                if !suspending.contains(name) && def.callees.iter().any(|c| suspending.contains(c)) {
                    suspending.insert(name.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            rounds += 1;
        }
        (suspending, rounds)
    }
}

/// A definition site, for rewriting its `def`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefSite {
    pub name: String,
    pub is_async: bool,
    pub def_token: usize,
}

/// Everything the transform needs from one walk of the tree.
#[derive(Debug, Default)]
pub struct Analysis {
    pub graph: CallGraph,
    pub defs: Vec<DefSite>,
    pub calls: Vec<CallSite>,
}

impl Analysis {
    pub fn of(module: &Module) -> Self {
        let mut analysis = Self::default();
        analysis.suite(module, &module.body, None);
        analysis.calls.sort_by_key(|c| c.open);
        analysis
    }

    fn suite(&mut self, module: &Module, suite: &Suite, scope: Option<&str>) {
        for statement in &suite.statements {
            match statement {
                Statement::Simple(range) => self.record(module, range.clone(), scope),
                Statement::Compound { header, body } => {
                    self.record(module, header.clone(), scope);
                    self.body(module, body, scope);
                }
                Statement::Def(def) => {
                    // Defaults and annotations are evaluated in the enclosing scope.
                    self.record(module, def.header.clone(), scope);
                    self.graph.defs.entry(def.name.clone()).or_default();
                    self.defs.push(DefSite {
                        name: def.name.clone(),
                        is_async: def.is_async,
                        def_token: def.def_token,
                    });
                    self.body(module, &def.body, Some(&def.name));
                }
            }
        }
    }

    fn body(&mut self, module: &Module, body: &Body, scope: Option<&str>) {
        match body {
            Body::Block(suite) => self.suite(module, suite, scope),
            Body::Inline(range) => self.record(module, range.clone(), scope),
        }
    }

    fn record(&mut self, module: &Module, range: std::ops::Range<usize>, scope: Option<&str>) {
        for call in module.calls_in(range) {
            if let Some(owner) = scope {
                let def = self.graph.defs.entry(owner.to_string()).or_default();
                if is_input_call(&call.callee) {
                    def.calls_input = true;
                } else if let Some(name) = call.callee.name() {
                    def.callees.insert(name.to_string());
                }
            }
            self.calls.push(call);
        }
    }
}
