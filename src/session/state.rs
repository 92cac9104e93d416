/// Lifecycle of a session's explicit transaction.
///
/// `Starting` reserves the slot while `BEGIN` is still in flight, so two
/// concurrent `begin` calls on the same session cannot both win; the loser
/// sees a non-idle state and fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Starting,
    Active,
    Committing,
    RollingBack,
}

impl TransactionState {
    /// True once `BEGIN` has completed and statements route to the pinned
    /// connection.
    pub fn is_active(self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_idle(self) -> bool {
        matches!(self, TransactionState::Idle)
    }
}
