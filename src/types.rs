use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Scalar format shared by every vector in one stream.
#[repr(u8)]
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float = 0,
    Double = 1,
}

impl DataType {
    /// Width in bytes of one sample.
    pub fn width(self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Double => 8,
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::Float),
            1 => Ok(DataType::Double),
            other => Err(ProtocolError::UnknownDiscriminant {
                field: "dataType",
                value: other as u32,
            }),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum DistanceType {
    Manhattan = 0,
    Euclidean = 1,
    DotProduct = 2,
    Cosine = 3,
}

impl TryFrom<u8> for DistanceType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DistanceType::Manhattan),
            1 => Ok(DistanceType::Euclidean),
            2 => Ok(DistanceType::DotProduct),
            3 => Ok(DistanceType::Cosine),
            other => Err(ProtocolError::UnknownDiscriminant {
                field: "distanceType",
                value: other as u32,
            }),
        }
    }
}

/// Command tag carried in every envelope.
#[repr(u32)]
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Ping = 0,
    Info = 1,
    Search = 2,
    Train = 3,
    Save = 4,
    Exit = 5,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Info => "info",
            Command::Search => "search",
            Command::Train => "train",
            Command::Save => "save",
            Command::Exit => "exit",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Ping),
            1 => Ok(Command::Info),
            2 => Ok(Command::Search),
            3 => Ok(Command::Train),
            4 => Ok(Command::Save),
            5 => Ok(Command::Exit),
            other => Err(ProtocolError::UnknownDiscriminant {
                field: "cmd",
                value: other,
            }),
        }
    }
}
