pub mod attendance;
pub mod credential;
pub mod event;
pub mod ticket;

pub use attendance::{Attendance, NewAttendance, ScanResult};
pub use credential::{TicketCredential, CREDENTIAL_VERSION};
pub use event::{CheckInPolicy, Event};
pub use ticket::{Ticket, TicketStatus, UnknownVariant};
