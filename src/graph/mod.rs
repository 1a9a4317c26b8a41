//! In-memory knowledge graph, built by parsing a tenant's vault.
//!
//! Nodes are stored in an arena (`Vec<Node>`) addressed by integer index,
//! avoiding the cyclic strong references a string-keyed, pointer-heavy
//! graph would otherwise risk (§9 "arena + integer indices"). Edges are
//! stored twice, once per direction, keyed by node index (§9 "graph cycles
//! and back-references").

use crate::markdown;
use crate::vault::VaultStore;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Matches a bulleted Facts/Relations line carrying a wikilink, optionally
/// preceded by a direction arrow and a `**type**` token (§4.5).
static EDGE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-\s*(→|←)?\s*(?:\*\*([^*]+)\*\*\s*)?\[\[([^\]|]+)(?:\|[^\]]+)?\]\]").expect("valid regex")
});

/// Default relation type for a wikilink with no preceding `**type**` token
/// (§4.5, resolving §9 ambiguity #2: one default for every untyped link,
/// inside or outside a Relations line).
pub const DEFAULT_RELATION_TYPE: &str = "related_to";

/// Opaque index into the graph's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A graph node: either a real entity or an auxiliary tag node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A materialized entity, carrying its `type` front-matter value.
    Entity(String),
    /// An auxiliary node for an inline `#tag`, ignored by retrieval
    /// assembly (§4.5).
    Tag,
}

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// This node's arena index.
    pub id: NodeId,
    /// Canonical entity name (or tag name).
    pub name: String,
    /// Entity or tag.
    pub kind: NodeKind,
}

impl Node {
    /// `true` if this node is an auxiliary tag node.
    #[must_use]
    pub fn is_tag(&self) -> bool {
        matches!(self.kind, NodeKind::Tag)
    }
}

/// Which side of a relation the traversal started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The query's entity is the relation's source.
    Outgoing,
    /// The query's entity is the relation's target.
    Incoming,
}

/// One hop of a `get_neighbors` expansion.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighboring node.
    pub node: Node,
    /// The relation type connecting them.
    pub relation_type: String,
    /// Which side the query began on.
    pub direction: Direction,
}

/// Induced node/edge lists for visualization (§4.5 `get_subgraph`).
#[derive(Debug, Clone)]
pub struct Subgraph {
    /// Nodes reachable within the requested depth, including the center.
    pub nodes: Vec<Node>,
    /// Edges among those nodes: `(from, to, relation_type)`.
    pub edges: Vec<(NodeId, NodeId, String)>,
}

/// Totals over the graph (§4.5 `stats`).
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    /// Number of non-tag entity nodes.
    pub entities: usize,
    /// Number of directed relation edges (each stored once per direction,
    /// counted once here).
    pub relations: usize,
}

#[derive(Debug, Clone)]
struct Edge {
    to: NodeId,
    relation_type: String,
}

/// The derived knowledge graph for one tenant.
pub struct KnowledgeGraph {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    outgoing: HashMap<NodeId, Vec<Edge>>,
    incoming: HashMap<NodeId, Vec<Edge>>,
    relation_count: usize,
}

impl KnowledgeGraph {
    /// Builds the graph by parsing every note in `vault` (§4.5
    /// "Construction").
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn build_from_vault(vault: &VaultStore) -> Result<Self> {
        let notes = vault.read_all_notes()?;
        Ok(Self::build(&notes))
    }

    /// Builds the graph from already-read `(entity name, raw note content)`
    /// pairs, without touching disk. Exposed for testing and for callers
    /// that already hold the notes.
    #[must_use]
    pub fn build(notes: &[(String, String)]) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            relation_count: 0,
        };

        for (name, _) in notes {
            graph.intern_entity(name, None);
        }

        for (name, content) in notes {
            let (frontmatter, body) = markdown::parse_frontmatter(content);
            let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());
            let from_id = graph.intern_entity(name, Some(entity_type));

            for tag in markdown::extract_tags(body, &frontmatter) {
                graph.intern_tag(&tag);
            }

            for section in markdown::extract_sections(body) {
                if section.title != "Facts" && section.title != "Relations" {
                    continue;
                }
                for line in section.content.lines() {
                    let Some(captures) = EDGE_LINE_RE.captures(line.trim()) else {
                        continue;
                    };
                    let incoming_arrow = captures.get(1).is_some_and(|m| m.as_str() == "←");
                    let relation_type = captures
                        .get(2)
                        .map_or(DEFAULT_RELATION_TYPE.to_string(), |m| m.as_str().to_string());
                    let other_name = captures.get(3).expect("wikilink target group").as_str().trim();
                    let to_id = graph.intern_entity(other_name, None);

                    if incoming_arrow {
                        graph.add_edge(to_id, from_id, relation_type);
                    } else {
                        graph.add_edge(from_id, to_id, relation_type);
                    }
                }
            }
        }

        graph
    }

    fn intern_entity(&mut self, name: &str, entity_type: Option<String>) -> NodeId {
        if let Some(&id) = self.by_name.get(&name.to_ascii_lowercase()) {
            if let Some(entity_type) = entity_type {
                self.nodes[id.0].kind = NodeKind::Entity(entity_type);
            }
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            kind: NodeKind::Entity(entity_type.unwrap_or_else(|| "concept".to_string())),
        });
        self.by_name.insert(name.to_ascii_lowercase(), id);
        id
    }

    fn intern_tag(&mut self, name: &str) -> NodeId {
        let key = name.to_ascii_lowercase();
        if let Some(&id) = self.by_name.get(&key) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, name: name.to_string(), kind: NodeKind::Tag });
        self.by_name.insert(key, id);
        id
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, relation_type: String) {
        self.outgoing.entry(from).or_default().push(Edge { to, relation_type: relation_type.clone() });
        self.incoming.entry(to).or_default().push(Edge { to: from, relation_type });
        self.relation_count += 1;
    }

    /// Case-insensitive exact match against note names (§4.5
    /// `find_entity`).
    #[must_use]
    pub fn find_entity(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Returns the node for `id`, if it exists.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Breadth-first neighbor expansion to `depth` levels, deduplicated by
    /// node id in visit order (§4.5 `get_neighbors`). Tag nodes are
    /// included; callers may filter them.
    #[must_use]
    pub fn get_neighbors(&self, id: NodeId, depth: usize) -> Vec<Neighbor> {
        let mut visited = std::collections::HashSet::new();
        visited.insert(id);
        let mut frontier = vec![id];
        let mut result = Vec::new();

        for _ in 0..depth {
            let mut next_frontier = Vec::new();
            for current in &frontier {
                for edge in self.outgoing.get(current).into_iter().flatten() {
                    if visited.insert(edge.to) {
                        if let Some(node) = self.node(edge.to) {
                            result.push(Neighbor {
                                node: node.clone(),
                                relation_type: edge.relation_type.clone(),
                                direction: Direction::Outgoing,
                            });
                        }
                        next_frontier.push(edge.to);
                    }
                }
                for edge in self.incoming.get(current).into_iter().flatten() {
                    if visited.insert(edge.to) {
                        if let Some(node) = self.node(edge.to) {
                            result.push(Neighbor {
                                node: node.clone(),
                                relation_type: edge.relation_type.clone(),
                                direction: Direction::Incoming,
                            });
                        }
                        next_frontier.push(edge.to);
                    }
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        result
    }

    /// Induced node/edge lists around `id` to `depth` levels (§4.5
    /// `get_subgraph`).
    #[must_use]
    pub fn get_subgraph(&self, id: NodeId, depth: usize) -> Subgraph {
        let neighbors = self.get_neighbors(id, depth);
        let mut node_ids: Vec<NodeId> = vec![id];
        node_ids.extend(neighbors.iter().map(|n| n.node.id));
        let node_set: std::collections::HashSet<NodeId> = node_ids.iter().copied().collect();

        let mut edges = Vec::new();
        for &n in &node_ids {
            for edge in self.outgoing.get(&n).into_iter().flatten() {
                if node_set.contains(&edge.to) {
                    edges.push((n, edge.to, edge.relation_type.clone()));
                }
            }
        }

        let nodes = node_ids.into_iter().filter_map(|n| self.node(n).cloned()).collect();
        Subgraph { nodes, edges }
    }

    /// Totals over the graph (§4.5 `stats`).
    #[must_use]
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            entities: self.nodes.iter().filter(|n| !n.is_tag()).count(),
            relations: self.relation_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &str, body: &str) -> (String, String) {
        (name.to_string(), format!("---\ntype: concept\n---\n\n# {name}\n\n{body}\n"))
    }

    #[test]
    fn test_find_entity_case_insensitive() {
        let notes = vec![note("Uzum Bank", "## Facts\n\n- a bank")];
        let graph = KnowledgeGraph::build(&notes);
        assert!(graph.find_entity("uzum bank").is_some());
    }

    #[test]
    fn test_relation_edge_parsed_with_type() {
        let notes = vec![
            note("Ali", "## Relations\n\n- → **works_at** [[Uzum Bank]]: backend dev"),
            note("Uzum Bank", "## Facts\n\n- a bank"),
        ];
        let graph = KnowledgeGraph::build(&notes);
        let ali = graph.find_entity("Ali").expect("ali exists");
        let neighbors = graph.get_neighbors(ali, 1);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].node.name, "Uzum Bank");
        assert_eq!(neighbors[0].relation_type, "works_at");
        assert!(matches!(neighbors[0].direction, Direction::Outgoing));
    }

    #[test]
    fn test_plain_wikilink_defaults_to_related_to() {
        let notes = vec![
            note("Mengram", "## Facts\n\n- uses [[PostgreSQL]] as its database"),
            note("PostgreSQL", "## Facts\n\n- relational database"),
        ];
        let graph = KnowledgeGraph::build(&notes);
        let mengram = graph.find_entity("Mengram").expect("exists");
        let neighbors = graph.get_neighbors(mengram, 1);
        assert_eq!(neighbors[0].relation_type, DEFAULT_RELATION_TYPE);
    }

    #[test]
    fn test_incoming_arrow_reverses_direction() {
        let notes = vec![note("Uzum Bank", "## Relations\n\n- ← **works_at** [[Ali]]")];
        let graph = KnowledgeGraph::build(&notes);
        let bank = graph.find_entity("Uzum Bank").expect("exists");
        let neighbors = graph.get_neighbors(bank, 1);
        assert_eq!(neighbors[0].node.name, "Ali");
        assert!(matches!(neighbors[0].direction, Direction::Incoming));
    }

    #[test]
    fn test_tag_nodes_are_marked() {
        let notes = vec![note("Mengram", "## Facts\n\n- uses #rust")];
        let graph = KnowledgeGraph::build(&notes);
        let tag = graph.find_entity("rust").expect("tag exists");
        assert!(graph.node(tag).expect("node").is_tag());
    }

    #[test]
    fn test_stats_counts_entities_and_relations() {
        let notes = vec![
            note("Ali", "## Relations\n\n- → **works_at** [[Uzum Bank]]"),
            note("Uzum Bank", ""),
        ];
        let graph = KnowledgeGraph::build(&notes);
        let stats = graph.stats();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.relations, 1);
    }

    #[test]
    fn test_depth_two_expansion() {
        let notes = vec![
            note("A", "## Relations\n\n- → **uses** [[B]]"),
            note("B", "## Relations\n\n- → **uses** [[C]]"),
            note("C", ""),
        ];
        let graph = KnowledgeGraph::build(&notes);
        let a = graph.find_entity("A").expect("exists");
        let depth1 = graph.get_neighbors(a, 1);
        assert_eq!(depth1.len(), 1);
        let depth2 = graph.get_neighbors(a, 2);
        assert_eq!(depth2.len(), 2);
    }
}
