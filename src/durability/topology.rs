use crate::error::EpkvError;
use smallvec::SmallVec;

/// One replication chain: 1..=4 node slots, the first being the active.
/// `None` slots are placeholders for replicas not yet assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationChain {
    nodes: SmallVec<[Option<String>; 4]>,
}

impl ReplicationChain {
    pub fn new(nodes: impl IntoIterator<Item = Option<String>>) -> Result<Self, EpkvError> {
        let nodes: SmallVec<[Option<String>; 4]> = nodes.into_iter().collect();
        if nodes.is_empty() || nodes.len() > 4 {
            return Err(EpkvError::InvalidTopology(format!(
                "chain must have 1..=4 nodes, got {}",
                nodes.len()
            )));
        }
        match nodes.first() {
            Some(Some(active)) if !active.is_empty() => {}
            _ => {
                return Err(EpkvError::InvalidTopology(
                    "first chain entry must be a node name".into(),
                ));
            }
        }
        for (i, a) in nodes.iter().enumerate() {
            let Some(a) = a else { continue };
            for b in nodes.iter().skip(i + 1).flatten() {
                if a == b {
                    return Err(EpkvError::InvalidTopology(format!(
                        "duplicate node '{a}' within a chain"
                    )));
                }
            }
        }
        Ok(Self { nodes })
    }

    pub fn active(&self) -> &str {
        self.nodes[0].as_deref().expect("validated at construction")
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn defined_nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().flatten().map(String::as_str)
    }

    pub fn num_defined(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.defined_nodes().any(|n| n == node)
    }

    /// Enough defined nodes to ever reach majority?
    pub fn durability_possible(&self) -> bool {
        self.num_defined() >= self.majority()
    }
}

/// 1..=2 replication chains. The second chain appears during rebalance when
/// the partition is moving to a new set of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTopology {
    chains: SmallVec<[ReplicationChain; 2]>,
}

impl ReplicationTopology {
    pub fn new(chains: impl IntoIterator<Item = ReplicationChain>) -> Result<Self, EpkvError> {
        let chains: SmallVec<[ReplicationChain; 2]> = chains.into_iter().collect();
        if chains.is_empty() || chains.len() > 2 {
            return Err(EpkvError::InvalidTopology(format!(
                "topology must have 1..=2 chains, got {}",
                chains.len()
            )));
        }
        Ok(Self { chains })
    }

    /// Accept the wire form: `[[active, replica?, ...], [...]?]` where
    /// replica slots may be `null`.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, EpkvError> {
        let outer = raw
            .as_array()
            .ok_or_else(|| EpkvError::InvalidTopology("topology must be an array".into()))?;
        let mut chains = Vec::with_capacity(outer.len());
        for chain in outer {
            let entries = chain.as_array().ok_or_else(|| {
                EpkvError::InvalidTopology("each chain must be an array".into())
            })?;
            let mut nodes = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    serde_json::Value::Null => nodes.push(None),
                    serde_json::Value::String(name) => nodes.push(Some(name.clone())),
                    other => {
                        return Err(EpkvError::InvalidTopology(format!(
                            "chain entry must be a string or null, got {other}"
                        )));
                    }
                }
            }
            chains.push(ReplicationChain::new(nodes)?);
        }
        Self::new(chains)
    }

    pub fn parse_str(raw: &str) -> Result<Self, EpkvError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| EpkvError::InvalidTopology(format!("bad topology json: {e}")))?;
        Self::parse(&value)
    }

    pub fn chains(&self) -> &[ReplicationChain] {
        &self.chains
    }

    pub fn first_chain(&self) -> &ReplicationChain {
        &self.chains[0]
    }

    /// Every chain can reach majority.
    pub fn durability_possible(&self) -> bool {
        self.chains.iter().all(ReplicationChain::durability_possible)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.chains.iter().any(|c| c.contains(node))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.chains
                .iter()
                .map(|chain| {
                    serde_json::Value::Array(
                        chain
                            .nodes
                            .iter()
                            .map(|n| match n {
                                Some(name) => serde_json::Value::String(name.clone()),
                                None => serde_json::Value::Null,
                            })
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}
