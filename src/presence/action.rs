//! Presence action kinds recognized by the platform.

use crate::error::ConfigError;

use serde::{Deserialize, Serialize};

/// The chat action shown to other participants while a ticker runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Typing,
    UploadPhoto,
    RecordVideo,
    UploadVideo,
    RecordVoice,
    UploadVoice,
    UploadDocument,
    ChooseSticker,
    FindLocation,
    RecordVideoNote,
    UploadVideoNote,
}

impl PresenceAction {
    /// Every supported action, in the order they are handed out to bots
    /// that don't configure one.
    pub const ALL: [PresenceAction; 11] = [
        PresenceAction::Typing,
        PresenceAction::UploadPhoto,
        PresenceAction::RecordVideo,
        PresenceAction::UploadVideo,
        PresenceAction::RecordVoice,
        PresenceAction::UploadVoice,
        PresenceAction::UploadDocument,
        PresenceAction::ChooseSticker,
        PresenceAction::FindLocation,
        PresenceAction::RecordVideoNote,
        PresenceAction::UploadVideoNote,
    ];

    /// Action assigned to the bot at `index` when none is configured.
    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceAction::Typing => "typing",
            PresenceAction::UploadPhoto => "upload_photo",
            PresenceAction::RecordVideo => "record_video",
            PresenceAction::UploadVideo => "upload_video",
            PresenceAction::RecordVoice => "record_voice",
            PresenceAction::UploadVoice => "upload_voice",
            PresenceAction::UploadDocument => "upload_document",
            PresenceAction::ChooseSticker => "choose_sticker",
            PresenceAction::FindLocation => "find_location",
            PresenceAction::RecordVideoNote => "record_video_note",
            PresenceAction::UploadVideoNote => "upload_video_note",
        }
    }
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PresenceAction {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| ConfigError::InvalidAction(value.to_string()))
    }
}
