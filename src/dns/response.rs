//! The resolver's best-effort view of a parsed DNS answer.
//!
//! Grounded in `original_source/lib/exaproxy/dns/definition.py`'s
//! `DNSResponseType`, carried over in idiomatic Rust rather than
//! translated line for line. The binary wire codec that produces this
//! value is an external collaborator (the "DNS parser" in spec.md §4.1)
//! and out of scope here.

use rand::seq::IndexedRandom;
use std::collections::HashMap;

/// One entry of the query section: the name and type the client asked
/// for. Unlike `ResourceRecord`, a query carries no answer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub question: String,
    pub querytype: String,
}

/// A single resource record as it appears in the answer, authority, or
/// additional section: name, textual type (e.g. `"A"`, `"AAAA"`,
/// `"CNAME"`), and textual rdata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub question: String,
    pub querytype: String,
    pub response: String,
}

/// A nested `name -> rrtype -> [rdata]` index built from the response's
/// answer, authority, and additional sections. Duplicates are preserved.
pub type ResponseMap = HashMap<String, HashMap<String, Vec<String>>>;

/// A parsed DNS response, as handed to the resolver/cache that feeds
/// hostnames into the content manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub identifier: u16,
    pub complete: bool,
    pub queries: Vec<Query>,
    pub responses: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
    /// First query's type, or `None` when `queries` is empty.
    pub qtype: Option<String>,
    /// First query's name, or `None` when `queries` is empty.
    pub qhost: Option<String>,
}

impl DnsResponse {
    /// Construct a response.
    ///
    /// If `complete` is `false`, all four sequences are discarded and the
    /// response is treated as empty, matching spec.md §3's invariant.
    /// Taking owned `Vec`s (never `Option<Vec>`) avoids the open question
    /// in spec.md §9 about conflating "partial" with "empty": there is no
    /// `None` shape for a sequence to begin with, only "caller passed
    /// fewer records than expected", which `complete: false` already
    /// communicates.
    pub fn new(
        identifier: u16,
        complete: bool,
        queries: Vec<Query>,
        responses: Vec<ResourceRecord>,
        authorities: Vec<ResourceRecord>,
        additionals: Vec<ResourceRecord>,
    ) -> Self {
        let (queries, responses, authorities, additionals) = if complete {
            (queries, responses, authorities, additionals)
        } else {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new())
        };

        let (qtype, qhost) = match queries.first() {
            Some(q) => (Some(q.querytype.clone()), Some(q.question.clone())),
            None => (None, None),
        };

        Self {
            identifier,
            complete,
            queries,
            responses,
            authorities,
            additionals,
            qtype,
            qhost,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Every record in the answer, authority, then additional sections,
    /// in registration order. Re-invoke to iterate again.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.responses
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Build the two-level `name -> rrtype -> [rdata]` index covering
    /// responses, authorities, and additionals. Duplicates preserved.
    pub fn get_response(&self) -> ResponseMap {
        let mut info: ResponseMap = HashMap::new();
        for rr in self.resources() {
            info.entry(rr.question.clone())
                .or_default()
                .entry(rr.querytype.clone())
                .or_default()
                .push(rr.response.clone());
        }
        info
    }

    /// Return one rdata value uniformly at random from
    /// `map[name][rrtype]`, or `None` if there is no such entry.
    pub fn extract(map: &ResponseMap, name: &str, rrtype: &str) -> Option<String> {
        map.get(name)
            .and_then(|by_type| by_type.get(rrtype))
            .and_then(|values| values.choose(&mut rand::rng()))
            .cloned()
    }

    /// Resolve `(name, rrtype)`, defaulting either to the first query's
    /// fields when not given. Returns the (possibly defaulted) rrtype
    /// alongside the resolved value, which is `None` on no match.
    pub fn get_value(
        &self,
        name: Option<&str>,
        rrtype: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let first = self.queries.first();

        let name = name
            .map(str::to_string)
            .or_else(|| first.map(|q| q.question.clone()));
        let rrtype = rrtype
            .map(str::to_string)
            .or_else(|| first.map(|q| q.querytype.clone()));

        let info = self.get_response();
        let value = match (&name, &rrtype) {
            (Some(n), Some(t)) => Self::extract(&info, n, t),
            _ => None,
        };

        (rrtype, value)
    }

    /// Follow CNAME indirection from the first query's name, then
    /// resolve the original query's rrtype on the terminal name.
    ///
    /// Bounded by the number of response records plus one, so malformed
    /// or cyclic CNAME data cannot loop forever (spec.md §8 property 7).
    pub fn get_chained_value(&self) -> (Option<String>, Option<String>) {
        let Some(first) = self.queries.first() else {
            return self.get_value(None, None);
        };

        let mut cname: Option<String> = None;
        let mut question = Some(first.question.clone());

        let max_hops = self.responses.len() + 1;
        for _ in 0..max_hops {
            let Some(q) = question.take() else { break };
            cname = Some(q.clone());
            let (_, value) = self.get_value(Some(&q), Some("CNAME"));
            question = value;
            if question.is_none() {
                break;
            }
        }

        self.get_value(cname.as_deref(), None)
    }

    /// The rdata of the first answer-section record whose type is
    /// `"CNAME"`, if any.
    pub fn get_related(&self) -> Option<String> {
        self.responses
            .iter()
            .find(|rr| rr.querytype == "CNAME")
            .map(|rr| rr.response.clone())
    }
}
