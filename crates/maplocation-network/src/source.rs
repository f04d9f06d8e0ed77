//! Pull-based access to the host's world state
//!
//! The transmitter never talks to the host runtime directly. Whatever owns the
//! player and the loot layout implements [`DataSource`] and hands it over.

use crate::types::{ItemRecord, PositionRecord};

/// World state the transmitter samples on every tick.
///
/// Both methods run on the transmitter's tick thread and should return
/// quickly; a slow call delays the tick. A panic inside either method is
/// caught and logged, and that tick sends nothing further.
pub trait DataSource: Send + 'static {
    /// Current player snapshot, or `None` while there is no player to report
    /// (e.g. between raids)
    fn current_position(&mut self) -> Option<PositionRecord>;

    /// Current loose loot layout, or `None` while it is not loaded yet
    fn current_loot(&mut self) -> Option<Vec<ItemRecord>>;
}

/// [`DataSource`] built from a pair of closures
pub struct FnSource<P, L> {
    position: P,
    loot: L,
}

impl<P, L> FnSource<P, L>
where
    P: FnMut() -> Option<PositionRecord> + Send + 'static,
    L: FnMut() -> Option<Vec<ItemRecord>> + Send + 'static,
{
    pub fn new(position: P, loot: L) -> Self {
        Self { position, loot }
    }
}

impl<P, L> DataSource for FnSource<P, L>
where
    P: FnMut() -> Option<PositionRecord> + Send + 'static,
    L: FnMut() -> Option<Vec<ItemRecord>> + Send + 'static,
{
    fn current_position(&mut self) -> Option<PositionRecord> {
        (self.position)()
    }

    fn current_loot(&mut self) -> Option<Vec<ItemRecord>> {
        (self.loot)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Rotation, Vec3};

    #[test]
    fn test_fn_source() {
        let mut step = 0.0;
        let mut source = FnSource::new(
            move || {
                step += 1.0;
                Some(PositionRecord::new(
                    "woods",
                    Vec3::new(step, 0.0, 0.0),
                    Rotation::default(),
                ))
            },
            || None,
        );

        assert_eq!(source.current_position().unwrap().position.x, 1.0);
        assert_eq!(source.current_position().unwrap().position.x, 2.0);
        assert!(source.current_loot().is_none());
    }
}
