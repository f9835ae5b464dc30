use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use voice_state_core::capture::ScriptController;
use voice_state_core::TranscriptBuffer;

/// Closing fragments appended at the end of each synthetic utterance, so the
/// pause analyzer has some context to read.
const UTTERANCE_ENDINGS: &[&str] = &[
    "and then I was thinking that",
    "Thanks, bye!",
    "sounds good.",
    "so it was, um",
    "I want to go to the",
    "yeah",
    "we can talk later.",
];

/// Alternates speech bursts and pauses of random length until `shutdown`
/// flips.
pub async fn drive(
    controller: ScriptController,
    transcript: TranscriptBuffer,
    seed: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    loop {
        let pitch_hz = rng.random_range(90.0..350.0);
        let level = rng.random_range(0.1..0.95);
        let speak_for = Duration::from_millis(rng.random_range(800..3000));
        controller.set_voice(pitch_hz, level);
        tracing::debug!(pitch_hz, level, ?speak_for, "synthetic speech");
        if wait_or_shutdown(speak_for, &mut shutdown).await {
            break;
        }

        let ending = UTTERANCE_ENDINGS[rng.random_range(0..UTTERANCE_ENDINGS.len())];
        transcript.append(ending);
        controller.silence();

        let pause_for = Duration::from_millis(rng.random_range(300..4000));
        tracing::debug!(?pause_for, ending, "synthetic pause");
        if wait_or_shutdown(pause_for, &mut shutdown).await {
            break;
        }
    }
    controller.silence();
}

/// Returns `true` when shutdown was requested.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
