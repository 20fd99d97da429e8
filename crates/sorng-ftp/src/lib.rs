//! # SortOfRemote NG – FTP engine
//!
//! Plain-FTP protocol engine providing:
//!   • CRLF reply framing tolerant of arbitrary chunk boundaries
//!   • Multi-line reply assembly and status-code classification
//!   • Single-flight command/reply correlation with deadlines
//!   • PASV negotiation and raw data channels
//!   • Store / append / retrieve / list transfers with a bounded strict join
//!   • Recursive ensure-exists and subtree removal
//!   • Unix and Windows LIST parsing

pub mod ftp;
