//! Protobuf encoding of auctions on the pub/sub network.
//!
//! Decoders skip unknown fields, so newer publishers can add fields without
//! breaking older workers.

use std::collections::HashMap;

use forge_model::{
    Auction, AuctionKind, AuctionSubject, JobId, Matcher, ResourceKind, Signature, Ticket,
};
use prost::Message;

use crate::AuctionError;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuctionMessage {
    #[prost(enumeration = "Kind", tag = "1")]
    pub kind: i32,
    #[prost(enumeration = "Resource", tag = "2")]
    pub resource_kind: i32,
    #[prost(string, tag = "3")]
    pub signature: String,
    #[prost(message, optional, tag = "4")]
    pub matcher: Option<MatcherMessage>,
    #[prost(message, optional, tag = "5")]
    pub subject: Option<SubjectMessage>,
    #[prost(string, tag = "6")]
    pub origin_job_id: String,
    #[prost(uint32, tag = "7")]
    pub origin_attempt: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MatcherMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub requirements: HashMap<String, String>,
    #[prost(uint32, tag = "3")]
    pub min_capacity: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubjectMessage {
    #[prost(string, tag = "1")]
    pub config_id: String,
    #[prost(string, tag = "2")]
    pub application_id: String,
    #[prost(string, tag = "3")]
    pub project_id: String,
    #[prost(string, tag = "4")]
    pub branch: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Kind {
    Unspecified = 0,
    New = 1,
    Cancel = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Resource {
    Unspecified = 0,
    Database = 1,
    Storage = 2,
}

impl From<AuctionKind> for Kind {
    fn from(kind: AuctionKind) -> Self {
        match kind {
            AuctionKind::New => Kind::New,
            AuctionKind::Cancel => Kind::Cancel,
        }
    }
}

impl From<ResourceKind> for Resource {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Database => Resource::Database,
            ResourceKind::Storage => Resource::Storage,
        }
    }
}

impl From<&Auction> for AuctionMessage {
    fn from(auction: &Auction) -> Self {
        let (origin_job_id, origin_attempt) = match &auction.origin {
            Some(t) => (t.job_id.to_string(), t.attempt),
            None => (String::new(), 0),
        };

        AuctionMessage {
            kind: Kind::from(auction.kind) as i32,
            resource_kind: Resource::from(auction.resource_kind) as i32,
            signature: auction.signature.to_string(),
            matcher: Some(MatcherMessage {
                name: auction.matcher.name.clone(),
                requirements: auction
                    .matcher
                    .requirements
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                min_capacity: auction.matcher.min_capacity,
            }),
            subject: Some(SubjectMessage {
                config_id: auction.subject.config_id.clone(),
                application_id: auction.subject.application_id.clone(),
                project_id: auction.subject.project_id.clone(),
                branch: auction.subject.branch.clone(),
            }),
            origin_job_id,
            origin_attempt,
        }
    }
}

impl TryFrom<AuctionMessage> for Auction {
    type Error = AuctionError;

    fn try_from(msg: AuctionMessage) -> Result<Self, Self::Error> {
        let kind = match Kind::try_from(msg.kind) {
            Ok(Kind::New) => AuctionKind::New,
            Ok(Kind::Cancel) => AuctionKind::Cancel,
            _ => {
                return Err(AuctionError::InvalidAuction(format!(
                    "unknown auction kind {}",
                    msg.kind
                )));
            }
        };
        let resource_kind = match Resource::try_from(msg.resource_kind) {
            Ok(Resource::Database) => ResourceKind::Database,
            Ok(Resource::Storage) => ResourceKind::Storage,
            _ => {
                return Err(AuctionError::InvalidAuction(format!(
                    "unknown resource kind {}",
                    msg.resource_kind
                )));
            }
        };
        if msg.signature.is_empty() {
            return Err(AuctionError::InvalidAuction("signature is empty".into()));
        }

        let origin = if msg.origin_job_id.is_empty() {
            None
        } else {
            Some(Ticket::new(
                JobId::from(msg.origin_job_id),
                msg.origin_attempt,
            ))
        };
        if kind == AuctionKind::New && origin.is_none() {
            return Err(AuctionError::InvalidAuction(
                "new auction without origin job".into(),
            ));
        }

        let matcher = msg
            .matcher
            .map(|m| Matcher {
                name: m.name,
                requirements: m.requirements.into_iter().collect(),
                min_capacity: m.min_capacity,
            })
            .unwrap_or_default();
        let subject = msg
            .subject
            .map(|s| AuctionSubject {
                config_id: s.config_id,
                application_id: s.application_id,
                project_id: s.project_id,
                branch: s.branch,
            })
            .unwrap_or_default();

        Ok(Auction {
            kind,
            resource_kind,
            signature: Signature::from(msg.signature),
            matcher,
            subject,
            origin,
        })
    }
}

pub fn encode(auction: &Auction) -> Vec<u8> {
    AuctionMessage::from(auction).encode_to_vec()
}

pub fn decode(payload: &[u8]) -> Result<Auction, AuctionError> {
    let msg = AuctionMessage::decode(payload)?;
    Auction::try_from(msg)
}
