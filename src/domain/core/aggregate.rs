use uuid::Uuid;

/// A versioned consistency boundary.
///
/// Commands are checked against the current state and answered with events;
/// an empty event list means the command was already satisfied. State only
/// moves through `apply_event`, and stores persist the result with a
/// compare-and-set on `version`.
pub trait Aggregate: Sized + Send + Sync {
    type Event;
    type Command;
    type Error;

    fn aggregate_id(&self) -> Uuid;

    /// Bumped once per persisted command.
    fn version(&self) -> i64;

    /// Decide what `command` means for the current state.
    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Decide and fold in one step, leaving `self` untouched so the caller can
    /// still save against the version it loaded.
    fn execute(&self, command: &Self::Command) -> Result<(Vec<Self::Event>, Self), Self::Error>
    where
        Self: Clone,
    {
        let events = self.handle_command(command)?;
        let next = events.iter().try_fold(self.clone(), |mut state, event| -> Result<Self, Self::Error> {
            state.apply_event(event)?;
            Ok(state)
        })?;
        Ok((events, next))
    }
}
