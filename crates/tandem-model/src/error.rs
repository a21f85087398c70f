#![forbid(unsafe_code)]

//! Errors raised by the model layer.

use thiserror::Error;

use crate::ids::{ObjectId, TypeName};

/// Misuse of the [`IdTranslator`](crate::IdTranslator).
///
/// Both variants mean the caller tried to map an entity to a second identity,
/// which would break the inverse relationship between the two maps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("{type_name}|{client_id} is already translated to {existing}, refusing {requested}")]
    ClientAlreadyMapped {
        type_name: TypeName,
        client_id: ObjectId,
        existing: ObjectId,
        requested: ObjectId,
    },

    #[error("server id {type_name}|{server_id} already belongs to client id {existing}")]
    ServerAlreadyMapped {
        type_name: TypeName,
        server_id: ObjectId,
        existing: ObjectId,
    },
}

pub type Result<T> = std::result::Result<T, TranslateError>;
