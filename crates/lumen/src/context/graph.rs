use super::{Context, Pending};
use crate::{
    DeviceBuffer, EngineError, backend::CompletionToken, error::Result, kernels::{KernelCall, KernelInvocable}
};

/// Handle to an operation recorded in a [`DispatchGraph`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Issues operations for one module forward and tracks their tokens.
///
/// Node dependencies are named by [`NodeId`] instead of raw tokens; the graph turns them into
/// deduplicated wait lists. Independent nodes are submitted back to back without blocking.
pub struct DispatchGraph<'c> {
    ctx: &'c Context,
    nodes: Vec<Vec<CompletionToken>>,
}

impl<'c> DispatchGraph<'c> {
    /// The node standing for the caller's wait list.
    pub const ENTRY: NodeId = NodeId(0);

    pub fn new(ctx: &'c Context, entry: &[CompletionToken]) -> Self {
        Self {
            ctx,
            nodes: vec![entry.to_vec()],
        }
    }

    pub fn ctx(&self) -> &'c Context {
        self.ctx
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The union of the tokens behind `after`, sorted and deduplicated.
    pub fn waits(&self, after: &[NodeId]) -> Result<Vec<CompletionToken>> {
        let mut waits = Vec::new();
        for node in after {
            let tokens = self
                .nodes
                .get(node.0)
                .ok_or_else(|| EngineError::InvalidArgument(format!("node {} not in graph", node.0)))?;
            waits.extend_from_slice(tokens);
        }
        waits.sort_unstable();
        waits.dedup();
        Ok(waits)
    }

    fn push(&mut self, token: CompletionToken) -> NodeId {
        self.nodes.push(vec![token]);
        NodeId(self.nodes.len() - 1)
    }

    pub fn dispatch(&mut self, call: KernelCall, after: &[NodeId]) -> Result<NodeId> {
        let waits = self.waits(after)?;
        let token = self.ctx.dispatch(call, &waits)?;
        Ok(self.push(token))
    }

    pub fn call<K: KernelInvocable>(&mut self, args: K::Args<'_>, after: &[NodeId]) -> Result<(DeviceBuffer, NodeId)> {
        let waits = self.waits(after)?;
        let (buffer, token) = self.ctx.call::<K>(args, &waits)?;
        Ok((buffer, self.push(token)))
    }

    /// Run a child module's forward behind `after`.
    pub fn module<F>(&mut self, after: &[NodeId], forward: F) -> Result<(DeviceBuffer, NodeId)>
    where
        F: FnOnce(&Context, &[CompletionToken]) -> Result<Pending>,
    {
        let waits = self.waits(after)?;
        let pending = forward(self.ctx, &waits)?;
        Ok((pending.buffer, self.push(pending.token)))
    }

    /// The single token completing `node`.
    pub fn token(&self, node: NodeId) -> Result<CompletionToken> {
        match self.nodes.get(node.0).map(Vec::as_slice) {
            Some([token]) if node != Self::ENTRY => Ok(*token),
            _ => Err(EngineError::InvalidArgument(format!("node {} is not a dispatched operation", node.0))),
        }
    }

    pub fn finish(self, buffer: DeviceBuffer, node: NodeId) -> Result<Pending> {
        Ok(Pending::new(buffer, self.token(node)?))
    }
}
