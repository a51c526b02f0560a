// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Build service credentials.
//!
//! The store is read on every outgoing request and replaced only when the
//! node's secure settings reload, so it uses an atomic swap rather than a
//! lock. Replaced passwords are wiped before their memory is released.

use std::collections::HashMap;

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use snafu::location;
use std::sync::Arc;
use vecbuild_core::{Error, Result};

pub const USERNAME_PROPERTY: &str = "remote_build.username";
pub const PASSWORD_PROPERTY: &str = "remote_build.password";

/// A secret byte buffer that is wiped on drop.
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBytes(***)")
    }
}

/// Volatile writes so the wipe survives optimization.
fn wipe(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

/// Latin-1 bytes of a string, as Basic auth has historically been encoded.
/// Code points outside Latin-1 become `?`.
fn iso_8859_1_bytes(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|c| {
            let code_point = c as u32;
            if code_point <= 0xFF {
                code_point as u8
            } else {
                b'?'
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct Credentials {
    username: String,
    password: SecureBytes,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password: SecureBytes::new(iso_8859_1_bytes(password)),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Holder of the optional credential pair.
///
/// Readers observe either the previous pair or the new one, never a torn
/// mix, and rotation takes effect on the next request.
#[derive(Debug, Default)]
pub struct SecretStore {
    credentials: ArcSwapOption<Credentials>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the credential pair. The previous password is
    /// wiped once the last in-flight reader releases it.
    pub fn reload(&self, credentials: Option<Credentials>) {
        self.credentials.store(credentials.map(Arc::new));
    }

    /// Reload from secure settings properties. Username and password must be
    /// set together or not at all.
    pub fn reload_from_properties(&self, properties: &HashMap<String, String>) -> Result<()> {
        match (
            properties.get(USERNAME_PROPERTY),
            properties.get(PASSWORD_PROPERTY),
        ) {
            (Some(username), Some(password)) => {
                self.reload(Some(Credentials::new(username.clone(), password)));
                Ok(())
            }
            (None, None) => {
                self.reload(None);
                Ok(())
            }
            _ => Err(Error::invalid_input(
                format!("{USERNAME_PROPERTY} and {PASSWORD_PROPERTY} must be set together"),
                location!(),
            )),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.load().is_some()
    }

    /// `Basic` authorization header value for the current pair, if any.
    pub fn authorization_header(&self) -> Option<String> {
        let credentials = self.credentials.load();
        credentials.as_ref().map(|credentials| {
            let mut raw = iso_8859_1_bytes(&credentials.username);
            raw.push(b':');
            raw.extend_from_slice(credentials.password.as_bytes());
            let header = format!("Basic {}", STANDARD.encode(&raw));
            wipe(&mut raw);
            header
        })
    }
}
