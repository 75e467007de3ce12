//! Per-connection user identity.
//!
//! [`UserPreferences`] holds the user's display identity and notifies
//! subscribers when it changes. A [`SessionContext`] binds it to the
//! participant id of one connection; the presence channel reads identity
//! only through that context.

use std::sync::{Arc, Mutex, MutexGuard};

use logos_store::Disposer;
use serde::{Deserialize, Serialize};

use crate::awareness::ParticipantId;
use crate::listeners::Listeners;

/// Display identity of the local user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    /// CSS hex color, e.g. `#3d85f5`.
    pub color: String,
}

/// Shared, observable user identity.
///
/// Cloning yields another handle to the same preferences.
#[derive(Clone)]
pub struct UserPreferences {
    identity: Arc<Mutex<UserIdentity>>,
    listeners: Listeners<UserIdentity>,
}

impl UserPreferences {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_identity(UserIdentity {
            id: String::new(),
            name: name.into(),
            color: String::new(),
        })
    }

    pub fn from_identity(identity: UserIdentity) -> Self {
        Self {
            identity: Arc::new(Mutex::new(identity)),
            listeners: Listeners::new(),
        }
    }

    pub fn identity(&self) -> UserIdentity {
        self.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|identity| identity.name = name);
    }

    pub fn set_color(&self, color: impl Into<String>) {
        let color = color.into();
        self.update(|identity| identity.color = color);
    }

    /// Make `participant` the identity id for this session.
    ///
    /// An unset color falls back to one derived from the participant id.
    pub fn bind(&self, participant: &ParticipantId) {
        self.update(|identity| {
            identity.id = participant.to_string();
            if identity.color.is_empty() {
                identity.color = default_color(participant);
            }
        });
    }

    pub fn subscribe<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&UserIdentity) + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    fn update(&self, f: impl FnOnce(&mut UserIdentity)) {
        let changed = {
            let mut identity = self.lock();
            let before = identity.clone();
            f(&mut identity);
            (*identity != before).then(|| identity.clone())
        };
        if let Some(identity) = changed {
            self.listeners.emit(&identity);
        }
    }

    fn lock(&self) -> MutexGuard<'_, UserIdentity> {
        self.identity.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for UserPreferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserPreferences").field(&*self.lock()).finish()
    }
}

/// Stable, vivid color for a participant.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness
/// are fixed.
pub fn default_color(participant: &ParticipantId) -> String {
    let hash = participant
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Identity binding for one connection.
///
/// Created by the controller when the first sync completes and handed to
/// the presence channel.
#[derive(Debug, Clone)]
pub struct SessionContext {
    participant_id: ParticipantId,
    preferences: UserPreferences,
}

impl SessionContext {
    pub fn new(participant_id: ParticipantId, preferences: UserPreferences) -> Self {
        preferences.bind(&participant_id);
        Self { participant_id, preferences }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn preferences(&self) -> &UserPreferences {
        &self.preferences
    }

    pub fn identity(&self) -> UserIdentity {
        self.preferences.identity()
    }
}
