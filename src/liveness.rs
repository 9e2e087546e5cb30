use std::collections::BTreeSet;

/// Answers whether the task that owns an allocation still exists in the target.
///
/// Unknown owner ids are reported as not alive.
pub trait Liveness {
    fn is_owner_alive(&self, owner: i32) -> bool;
}

impl<F> Liveness for F
where
    F: Fn(i32) -> bool,
{
    fn is_owner_alive(&self, owner: i32) -> bool {
        self(owner)
    }
}

/// Set of owner ids known to be alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveOwners(BTreeSet<i32>);

impl LiveOwners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: i32) -> bool {
        self.0.insert(owner)
    }
}

impl FromIterator<i32> for LiveOwners {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Liveness for LiveOwners {
    fn is_owner_alive(&self, owner: i32) -> bool {
        self.0.contains(&owner)
    }
}
