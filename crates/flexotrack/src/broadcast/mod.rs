pub mod program_events;

pub use program_events::{
    ChangeNotifier, NotifyError, ProgramEvent, ProgramEventBroadcaster, ProgramEventKind,
};
