//! AN-002: The app context: an arena-backed construct tree.
//!
//! Every stack, construct and resource lives in one `Vec<Node>` owned by
//! [`App`]; parent/child links are indices. Stacks are tree roots; detached
//! constructs may be built up bottom-up and attached later. Outputs bind a
//! name to a resource attribute and are handed out as [`OutputRef`] values.

use super::types::{Environment, OutputRef, ResourceNode};
use crate::error::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use tracing::debug;

/// Index of a node in the app's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A node known to be a stack root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackRef(NodeId);

impl StackRef {
    pub fn node(self) -> NodeId {
        self.0
    }
}

impl From<StackRef> for NodeId {
    fn from(s: StackRef) -> Self {
        s.0
    }
}

/// Stack-level settings.
#[derive(Debug, Clone, Default)]
pub struct StackProps {
    pub description: Option<String>,
    pub env: Environment,
}

/// What a node is.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Stack(StackData),
    Construct,
    Resource(ResourceNode),
}

/// Stack payload: props plus explicit dependencies.
#[derive(Debug, Clone)]
pub struct StackData {
    pub props: StackProps,
    depends_on: IndexSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputBinding {
    resource: NodeId,
    attribute: String,
}

/// One entry in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
    outputs: IndexMap<String, OutputBinding>,
    resource_count: usize,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Resources in this node's subtree, itself included.
    pub fn resource_count(&self) -> usize {
        self.resource_count
    }

    pub fn resource(&self) -> Option<&ResourceNode> {
        match &self.kind {
            NodeKind::Resource(r) => Some(r),
            _ => None,
        }
    }
}

/// Root owner of every stack, construct and resource.
#[derive(Debug, Clone)]
pub struct App {
    name: String,
    nodes: Vec<Node>,
    stacks: Vec<StackRef>,
    node_dependencies: Vec<(NodeId, NodeId)>,
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            stacks: Vec::new(),
            node_dependencies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Declaration
    // ------------------------------------------------------------------

    /// Declare a new stack. Stack ids are unique within the app.
    pub fn add_stack(&mut self, id: impl Into<String>, props: StackProps) -> Result<StackRef> {
        let id = id.into();
        if self.stack(&id).is_some() {
            return Err(Error::DuplicateId {
                scope: self.name.clone(),
                id,
            });
        }
        let node = self.push(
            id,
            NodeKind::Stack(StackData {
                props,
                depends_on: IndexSet::new(),
            }),
        );
        let stack = StackRef(node);
        self.stacks.push(stack);
        debug!(stack = %self.node(node).id, "declared stack");
        Ok(stack)
    }

    /// Create a detached construct.
    pub fn new_construct(&mut self, id: impl Into<String>) -> NodeId {
        self.push(id.into(), NodeKind::Construct)
    }

    /// Create a detached resource; its node id is its logical id.
    pub fn new_resource(&mut self, resource: ResourceNode) -> NodeId {
        let id = resource.logical_id.clone();
        let node = self.push(id, NodeKind::Resource(resource));
        self.nodes[node.0].resource_count = 1;
        node
    }

    /// Attach `child` under `parent`, after any existing children.
    ///
    /// On error the tree is left exactly as it was.
    pub fn add_child(&mut self, parent: impl Into<NodeId>, child: NodeId) -> Result<()> {
        let parent = parent.into();
        self.check_attach(parent, child)?;

        let added = self.nodes[child.0].resource_count;
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);
        let mut cursor = Some(parent);
        while let Some(n) = cursor {
            self.nodes[n.0].resource_count += added;
            cursor = self.nodes[n.0].parent;
        }
        debug!(parent = %self.path(parent), child = %self.nodes[child.0].id, "attached");
        Ok(())
    }

    /// Create a construct and attach it in one step.
    pub fn add_construct(&mut self, parent: impl Into<NodeId>, id: impl Into<String>) -> Result<NodeId> {
        let parent = parent.into();
        let id = id.into();
        self.check_sibling(parent, &id)?;
        let node = self.new_construct(id);
        self.add_child(parent, node)?;
        Ok(node)
    }

    /// Create a resource and attach it in one step.
    pub fn add_resource(&mut self, parent: impl Into<NodeId>, resource: ResourceNode) -> Result<NodeId> {
        let parent = parent.into();
        self.check_sibling(parent, &resource.logical_id)?;
        let node = self.new_resource(resource);
        self.add_child(parent, node)?;
        Ok(node)
    }

    /// Record that stack `dependent` applies after stack `dependency`.
    pub fn add_dependency(&mut self, dependent: StackRef, dependency: StackRef) -> Result<()> {
        if dependent == dependency {
            return Err(Error::SelfDependency {
                id: self.nodes[dependent.0 .0].id.clone(),
            });
        }
        if let NodeKind::Stack(data) = &mut self.nodes[dependent.0 .0].kind {
            data.depends_on.insert(dependency.0);
        }
        Ok(())
    }

    /// Order everything under `dependent` after everything under `dependency`.
    ///
    /// Within one stack this becomes resource-level DependsOn; across stacks
    /// it becomes a stack edge. A node cannot depend on its own ancestor or
    /// descendant.
    pub fn add_node_dependency(&mut self, dependent: NodeId, dependency: NodeId) -> Result<()> {
        self.check_node(dependent)?;
        self.check_node(dependency)?;
        if self.overlaps(dependent, dependency) {
            return Err(Error::SelfDependency {
                id: self.path(dependent),
            });
        }
        if !self.node_dependencies.contains(&(dependent, dependency)) {
            self.node_dependencies.push((dependent, dependency));
        }
        Ok(())
    }

    /// Bind output `name` of `construct` to `attribute` of `resource`.
    ///
    /// The resource must sit inside the construct (or be the construct).
    /// Re-registering the same binding is a no-op.
    pub fn register_output(
        &mut self,
        construct: NodeId,
        name: impl Into<String>,
        resource: NodeId,
        attribute: impl Into<String>,
    ) -> Result<()> {
        self.check_node(construct)?;
        self.check_node(resource)?;
        let name = name.into();
        if self.nodes[resource.0].resource().is_none() {
            return Err(Error::config(format!(
                "output '{}' of '{}' must point at a resource, '{}' is not one",
                name,
                self.path(construct),
                self.path(resource)
            )));
        }
        if !self.is_within(resource, construct) {
            return Err(Error::config(format!(
                "output '{}' of '{}' points outside it at '{}'",
                name,
                self.path(construct),
                self.path(resource)
            )));
        }
        let binding = OutputBinding {
            resource,
            attribute: attribute.into(),
        };
        match self.nodes[construct.0].outputs.get(&name) {
            Some(existing) if *existing == binding => Ok(()),
            Some(_) => Err(Error::DuplicateId {
                scope: format!("{} outputs", self.path(construct)),
                id: name,
            }),
            None => {
                self.nodes[construct.0].outputs.insert(name, binding);
                Ok(())
            }
        }
    }

    /// Reference to a registered output of `construct`.
    pub fn get_output(&self, construct: NodeId, name: &str) -> Result<OutputRef> {
        self.check_node(construct)?;
        let binding = self.nodes[construct.0]
            .outputs
            .get(name)
            .ok_or_else(|| Error::UnknownOutput {
                construct: self.path(construct),
                name: name.to_string(),
            })?;
        let stack = self.stack_of(construct).ok_or_else(|| Error::Detached {
            path: self.path(construct),
        })?;
        Ok(OutputRef::new(
            self.stack_id(stack),
            self.nodes[binding.resource.0].id.clone(),
            binding.attribute.clone(),
        ))
    }

    /// Expose `attribute` of a resource under its own name and reference it.
    pub fn attribute(&mut self, resource: NodeId, attribute: &str) -> Result<OutputRef> {
        self.register_output(resource, attribute, resource, attribute)?;
        self.get_output(resource, attribute)
    }

    /// Mutable access to a resource for late property edits.
    pub fn resource_mut(&mut self, node: NodeId) -> Option<&mut ResourceNode> {
        match &mut self.nodes.get_mut(node.0)?.kind {
            NodeKind::Resource(r) => Some(r),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Stacks in declaration order.
    pub fn stacks(&self) -> &[StackRef] {
        &self.stacks
    }

    pub fn stack(&self, id: &str) -> Option<StackRef> {
        self.stacks.iter().copied().find(|s| self.nodes[s.0 .0].id == id)
    }

    /// Narrow a node id to a stack.
    pub fn as_stack(&self, node: NodeId) -> Result<StackRef> {
        self.check_node(node)?;
        match self.nodes[node.0].kind {
            NodeKind::Stack(_) => Ok(StackRef(node)),
            _ => Err(Error::NotAStack {
                id: self.path(node),
            }),
        }
    }

    pub fn stack_id(&self, stack: StackRef) -> &str {
        &self.nodes[stack.0 .0].id
    }

    pub fn stack_props(&self, stack: StackRef) -> &StackProps {
        match &self.nodes[stack.0 .0].kind {
            NodeKind::Stack(data) => &data.props,
            _ => unreachable!("StackRef always points at a stack"),
        }
    }

    /// Explicit dependencies of a stack, in the order they were added.
    pub fn explicit_dependencies(&self, stack: StackRef) -> Vec<StackRef> {
        match &self.nodes[stack.0 .0].kind {
            NodeKind::Stack(data) => data.depends_on.iter().map(|n| StackRef(*n)).collect(),
            _ => Vec::new(),
        }
    }

    pub fn node_dependencies(&self) -> &[(NodeId, NodeId)] {
        &self.node_dependencies
    }

    /// The stack a node ultimately sits in, if any.
    pub fn stack_of(&self, node: NodeId) -> Option<StackRef> {
        let root = self.root_of(node);
        match self.nodes[root.0].kind {
            NodeKind::Stack(_) => Some(StackRef(root)),
            _ => None,
        }
    }

    /// Slash-separated path from the tree root, e.g. `EksStack/Cluster/EksCluster`.
    pub fn path(&self, node: NodeId) -> String {
        let mut parts = vec![self.nodes[node.0].id.as_str()];
        let mut cursor = self.nodes[node.0].parent;
        while let Some(n) = cursor {
            parts.push(&self.nodes[n.0].id);
            cursor = self.nodes[n.0].parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Find a node by path from a stack root (`Stack/Construct/...`).
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut parts = path.split('/');
        let mut cursor = self.stack(parts.next()?)?.0;
        for part in parts {
            cursor = *self.nodes[cursor.0]
                .children
                .iter()
                .find(|c| self.nodes[c.0].id == part)?;
        }
        Some(cursor)
    }

    /// Resource nodes under `node`, depth-first in declaration order.
    pub fn resources_under(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.nodes[n.0].resource().is_some() {
                out.push(n);
            }
            stack.extend(self.nodes[n.0].children.iter().rev());
        }
        out
    }

    /// Output names and their references for every node under `node`.
    pub fn outputs_under(&self, node: NodeId) -> Vec<(NodeId, String, OutputRef)> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            for name in self.nodes[n.0].outputs.keys() {
                if let Ok(r) = self.get_output(n, name) {
                    out.push((n, name.clone(), r));
                }
            }
            stack.extend(self.nodes[n.0].children.iter().rev());
        }
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn push(&mut self, id: String, kind: NodeKind) -> NodeId {
        let node = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            parent: None,
            children: Vec::new(),
            kind,
            outputs: IndexMap::new(),
            resource_count: 0,
        });
        node
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::config(format!("node #{} does not belong to this app", node.0)))
        }
    }

    fn check_sibling(&self, parent: NodeId, id: &str) -> Result<()> {
        self.check_node(parent)?;
        if self.nodes[parent.0]
            .children
            .iter()
            .any(|c| self.nodes[c.0].id == id)
        {
            return Err(Error::DuplicateId {
                scope: self.path(parent),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn check_attach(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_node(parent)?;
        self.check_node(child)?;
        if let NodeKind::Resource(_) = self.nodes[parent.0].kind {
            return Err(Error::config(format!(
                "resource '{}' cannot have children",
                self.path(parent)
            )));
        }
        if let NodeKind::Stack(_) = self.nodes[child.0].kind {
            return Err(Error::config(format!(
                "stack '{}' cannot be attached under '{}'",
                self.nodes[child.0].id,
                self.path(parent)
            )));
        }
        if let Some(existing) = self.nodes[child.0].parent {
            return Err(Error::AlreadyAttached {
                id: self.nodes[child.0].id.clone(),
                parent: self.path(existing),
            });
        }
        if self.is_within(parent, child) {
            return Err(Error::TreeCycle {
                parent: self.path(parent),
                child: self.nodes[child.0].id.clone(),
            });
        }
        self.check_sibling(parent, &self.nodes[child.0].id)?;
        if let Some(stack) = self.stack_of(parent) {
            self.check_logical_ids(stack, child)?;
        }
        Ok(())
    }

    /// Logical ids arriving with `subtree` must be new to `stack` and to each other.
    fn check_logical_ids(&self, stack: StackRef, subtree: NodeId) -> Result<()> {
        let mut seen: HashSet<&str> = self
            .resources_under(stack.0)
            .into_iter()
            .map(|n| self.nodes[n.0].id.as_str())
            .collect();
        for n in self.resources_under(subtree) {
            let id = self.nodes[n.0].id.as_str();
            if !seen.insert(id) {
                return Err(Error::DuplicateId {
                    scope: self.stack_id(stack).to_string(),
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// True if `node` is `ancestor` or lies beneath it.
    /// True when one of the two nodes sits inside the other's subtree.
    pub fn overlaps(&self, a: NodeId, b: NodeId) -> bool {
        self.is_within(a, b) || self.is_within(b, a)
    }

    fn is_within(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            if n == ancestor {
                return true;
            }
            cursor = self.nodes[n.0].parent;
        }
        false
    }

    fn root_of(&self, node: NodeId) -> NodeId {
        let mut cursor = node;
        while let Some(p) = self.nodes[cursor.0].parent {
            cursor = p;
        }
        cursor
    }
}
