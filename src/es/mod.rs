//! ES (eticket services) data: signatures, certificates and tickets.

pub mod cert;
pub mod signature;
pub mod ticket;

pub use cert::{Certificate, CertificateChain, CertificateStore};
pub use signature::SignatureType;
pub use ticket::{Ticket, TicketSource, TicketStore, TitleKeyType};
