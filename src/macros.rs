//! Declarative helpers for the protocol tables (command codes, versions, error codes).

/// Generates `CommandType` with an `Unknown(code)` catch-all so that
/// unrecognised firmware commands survive decoding.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Tuya wire command codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandType {
            $($name,)*
            /// A code this crate does not know; kept as-is.
            Unknown(u32),
        }

        impl CommandType {
            /// Numeric code as written on the wire.
            pub fn code(self) -> u32 {
                match self {
                    $(CommandType::$name => $val,)*
                    CommandType::Unknown(code) => code,
                }
            }

            pub fn from_u32(code: u32) -> Self {
                match code {
                    $($val => CommandType::$name,)*
                    other => CommandType::Unknown(other),
                }
            }
        }

        impl From<u32> for CommandType {
            fn from(code: u32) -> Self {
                CommandType::from_u32(code)
            }
        }

        impl std::fmt::Display for CommandType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    CommandType::Unknown(code) => write!(f, "Unknown(0x{:02X})", code),
                    other => write!(f, "{:?}(0x{:02X})", other, other.code()),
                }
            }
        }
    };
}

/// Generates the ordered `Version` enum with its string form.
macro_rules! define_version {
    ($($name:ident = $s:literal),* $(,)?) => {
        /// Supported protocol versions, ordered oldest to newest.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Version {
            $($name,)*
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $s,)*
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($s => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::InvalidVersion(other.to_string())),
                }
            }
        }

        impl TryFrom<&str> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Generates `ERR_*` constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $val:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $val;)*

        /// Human readable message for a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($val => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
