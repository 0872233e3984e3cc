use std::path::PathBuf;

use crate::instance::InstanceName;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid instance name: '{0}'")]
    InvalidName(String),

    #[error("unix socket directory does not exist: {}", .0.display())]
    MissingDir(PathBuf),

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize dialer")]
    DialerInit(#[source] crate::dial::DialError),

    #[error("[{instance}] {source}")]
    Instance {
        instance: InstanceName,
        #[source]
        source: Box<Error>,
    },

    #[error("[{instance}] connection test failed")]
    ConnectionTest {
        instance: InstanceName,
        #[source]
        source: crate::dial::DialError,
    },

    #[error("[{0}] lookup failed")]
    Lookup(InstanceName, #[source] crate::dial::DialError),

    #[error("listener closed")]
    ListenerClosed,

    #[error("accept failed")]
    Accept(#[source] std::io::Error),

    #[error("failed to close dialer")]
    DialerClose(#[source] crate::dial::DialError),

    #[error("failed to close listener for {addr}")]
    Close {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to mount socket directory at {}", .0.display())]
    FuseMount(PathBuf, #[source] std::io::Error),

    #[error("{0} connection(s) still open after waiting")]
    ConnectionsStillOpen(u64),
}

impl Error {
    /// Wrap this error with the instance whose setup or teardown produced it.
    pub fn for_instance(self, instance: InstanceName) -> Error {
        Error::Instance {
            instance,
            source: Box::new(self),
        }
    }
}

/// An ordered collection of errors gathered across a multi-step operation,
/// such as broker shutdown closing many mounts.
#[derive(Debug, Default)]
pub struct MultiError(pub Vec<Error>);

impl MultiError {
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collapse into a `Result`, succeeding when no errors were gathered.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn multi_error_display_joins_in_order() {
        let mut multi = MultiError::default();
        multi.push(Error::ListenerClosed);
        multi.push(Error::ConnectionsStillOpen(3));
        assert_eq!(
            multi.to_string(),
            "listener closed, 3 connection(s) still open after waiting"
        );
    }

    #[test]
    fn empty_multi_error_is_ok() {
        assert!(MultiError::default().into_result().is_ok());
    }

    #[test]
    fn instance_wrapping_names_the_instance() {
        let inst: InstanceName = "p:r:i".parse().unwrap();
        let err = Error::ListenerClosed.for_instance(inst);
        assert_eq!(err.to_string(), "[p:r:i] listener closed");
    }
}
