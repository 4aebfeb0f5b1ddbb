use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use huddle_core::errors::RegistryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::tools::Tool;

/// Static description of one agent. Immutable once registered.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    /// Opaque payload for the model capability. Never exposed in summaries.
    pub instructions: String,
    pub tools: Vec<String>,
    pub handoffs: Vec<String>,
    pub guardrails: Vec<String>,
    /// Context fields seeded (when absent) as control is handed to this agent.
    pub on_enter: BTreeMap<String, Value>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            tools: Vec::new(),
            handoffs: Vec::new(),
            guardrails: Vec::new(),
            on_enter: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        push_unique(&mut self.tools, tool.into());
        self
    }

    pub fn with_handoff(mut self, target: impl Into<String>) -> Self {
        push_unique(&mut self.handoffs, target.into());
        self
    }

    pub fn with_guardrail(mut self, guardrail: impl Into<String>) -> Self {
        push_unique(&mut self.guardrails, guardrail.into());
        self
    }

    pub fn with_entry_default(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.on_enter.insert(field.into(), value.into());
        self
    }

    pub fn can_use_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|name| name == tool)
    }

    pub fn can_hand_off_to(&self, target: &str) -> bool {
        self.handoffs.iter().any(|name| name == target)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            handoffs: self.handoffs.clone(),
            tools: self.tools.clone(),
            guardrails: self.guardrails.clone(),
        }
    }
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub handoffs: Vec<String>,
    pub tools: Vec<String>,
    pub guardrails: Vec<String>,
}

/// Read-only catalog of agents and the tool implementations they reference.
///
/// Only constructible through [`RegistryBuilder::build`], which validates the
/// handoff graph, so a live registry is always closed over its references.
#[derive(Clone)]
pub struct AgentRegistry {
    entry: String,
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    known_guardrails: Option<BTreeSet<String>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("entry", &self.entry)
            .field("agents", &self.agents.iter().map(|agent| &agent.name).collect::<Vec<_>>())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    pub fn builder(entry: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new(entry)
    }

    pub fn get(&self, name: &str) -> Result<&AgentDefinition, RegistryError> {
        self.index
            .get(name)
            .map(|position| &self.agents[*position])
            .ok_or_else(|| RegistryError::UnknownAgent(name.to_owned()))
    }

    pub fn entry_agent(&self) -> &AgentDefinition {
        // `validate` guarantees the entry agent is registered.
        &self.agents[self.index[&self.entry]]
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(AgentDefinition::summary).collect()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if !self.index.contains_key(&self.entry) {
            return Err(RegistryError::InvalidRegistry(format!(
                "entry agent `{}` is not registered",
                self.entry
            )));
        }

        for agent in &self.agents {
            for tool in &agent.tools {
                if !self.tools.contains_key(tool) {
                    return Err(RegistryError::InvalidRegistry(format!(
                        "agent `{}` references unknown tool `{tool}`",
                        agent.name
                    )));
                }
            }
            for target in &agent.handoffs {
                if target == &agent.name {
                    return Err(RegistryError::InvalidRegistry(format!(
                        "agent `{}` lists itself as a handoff target",
                        agent.name
                    )));
                }
                if !self.index.contains_key(target) {
                    return Err(RegistryError::InvalidRegistry(format!(
                        "agent `{}` references unknown handoff target `{target}`",
                        agent.name
                    )));
                }
            }
            if let Some(known) = &self.known_guardrails {
                if let Some(unknown) = agent.guardrails.iter().find(|id| !known.contains(*id)) {
                    return Err(RegistryError::InvalidRegistry(format!(
                        "agent `{}` references unknown guardrail `{unknown}`",
                        agent.name
                    )));
                }
            }
        }

        let reachable = self.reachable_from_entry();
        if let Some(orphan) = self.agents.iter().find(|agent| !reachable.contains(&agent.name)) {
            return Err(RegistryError::InvalidRegistry(format!(
                "agent `{}` is not reachable from entry agent `{}`",
                orphan.name, self.entry
            )));
        }

        Ok(())
    }

    fn reachable_from_entry(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::from([self.entry.clone()]);
        let mut queue = VecDeque::from([self.entry.as_str()]);
        while let Some(name) = queue.pop_front() {
            let Some(position) = self.index.get(name) else {
                continue;
            };
            for target in &self.agents[*position].handoffs {
                if seen.insert(target.clone()) {
                    queue.push_back(target.as_str());
                }
            }
        }
        seen
    }
}

pub struct RegistryBuilder {
    entry: String,
    agents: Vec<AgentDefinition>,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    known_guardrails: Option<BTreeSet<String>>,
}

impl RegistryBuilder {
    pub fn new(entry: impl Into<String>) -> Self {
        Self { entry: entry.into(), agents: Vec::new(), tools: BTreeMap::new(), known_guardrails: None }
    }

    pub fn agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn tool<T>(mut self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_owned(), Arc::new(tool));
        self
    }

    pub fn shared_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_owned(), tool);
        self
    }

    /// Restricts guardrail identifiers to this set during validation.
    pub fn known_guardrails<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_guardrails = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<AgentRegistry, RegistryError> {
        let mut index = HashMap::with_capacity(self.agents.len());
        for (position, agent) in self.agents.iter().enumerate() {
            if index.insert(agent.name.clone(), position).is_some() {
                return Err(RegistryError::InvalidRegistry(format!(
                    "agent `{}` is registered twice",
                    agent.name
                )));
            }
        }

        let registry = AgentRegistry {
            entry: self.entry,
            agents: self.agents,
            index,
            tools: self.tools,
            known_guardrails: self.known_guardrails,
        };
        registry.validate()?;

        info!(
            event_name = "registry.validated",
            entry_agent = %registry.entry,
            agents = registry.agents.len(),
            tools = registry.tools.len(),
            "agent registry validated"
        );
        Ok(registry)
    }
}
