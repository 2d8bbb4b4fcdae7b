use tonic::Status;

use crate::core::PlexusError;

impl From<PlexusError> for Status {
    fn from(err: PlexusError) -> Status {
        match err {
            PlexusError::NotFound(msg) => Status::not_found(msg),
            PlexusError::InvalidArgument(msg) | PlexusError::BatchTooLarge(msg) => {
                Status::invalid_argument(msg)
            }
            PlexusError::OutOfMemory(msg) => Status::resource_exhausted(msg),
            PlexusError::Cancelled(msg) => Status::cancelled(msg),
            PlexusError::TypeMismatch(msg)
            | PlexusError::LeakedBuffers(msg)
            | PlexusError::ConfigError(msg)
            | PlexusError::IoError(msg)
            | PlexusError::Internal(msg) => Status::internal(msg),
        }
    }
}
