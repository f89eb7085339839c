//! Voice processing module
//!
//! Handles audio capture, decoding, activity monitoring, barge-in,
//! wake word detection, and playback.

mod analyser;
mod barge_in;
mod capture;
mod codec;
mod monitor;
mod playback;
mod wake_word;

pub use analyser::{FrequencyAnalyser, level_to_db, mean_level};
pub use barge_in::{BargeInDetector, BargeInEvent};
pub use capture::{
    CaptureConstraints, CaptureOwner, CpalMicrophone, MediaTracks, Microphone, MicrophoneArbiter,
    MicrophoneLease, OpenCapture, SAMPLE_RATE, stop_tracks,
};
pub use codec::{
    AudioChunk, DEFAULT_SAMPLE_RATE, PlayableAudio, decode, decode_with_default, parse_sample_rate,
    parse_sample_rate_or, wrap_pcm,
};
pub use monitor::{
    ActivityGate, AudioLevelSample, MonitorConfig, MonitorEvent, MonitorSink, Observation,
    SilenceEvent, SilenceTracker, VoiceActivityMonitor,
};
pub use playback::{
    AudioPlayer, AudioSink, CpalSink, PlaybackConfig, PlaybackHandle, PlaybackOutcome,
    PlaybackResource, ResourceTracker,
};
pub use wake_word::{
    ActivationEvent, KeywordMatch, KeywordMatcher, RecognitionError, RecognitionEvent,
    SpeechRecognizer, WakeWordConfig, WakeWordDetector, WakeWordState, levenshtein, similarity,
};
