slotmap::new_key_type! {
    /// Stable identity of a node inside a [`Runtime`](crate::runtime::Runtime).
    ///
    /// Opaque and monotonically assigned: never reused within a runtime's
    /// lifetime. `slotmap` tags every slot with a generation counter, so an
    /// id whose node has since been unregistered simply fails to resolve
    /// (`Runtime::upgrade` returns `None`) rather than aliasing whatever gets
    /// inserted into that slot afterwards. This generational check is what
    /// gives the registry's `subscribers` edges their weak-reference
    /// semantics for free: a stale `NodeId` left behind in a producer's
    /// subscriber set costs nothing but a failed lookup.
    pub struct NodeId;
}
