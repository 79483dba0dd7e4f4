mod response;

pub use response::{DnsResponse, Query, ResourceRecord};
