//! Status glyphs shared by the status table and the live watch display.

use console::Emoji;
use reelforge_common::StepStatus;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static IDLE: Emoji<'_, '_> = Emoji("⏸️  ", "[ ]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static WRENCH: Emoji<'_, '_> = Emoji("🔧 ", "[FIX]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static FILM: Emoji<'_, '_> = Emoji("🎬 ", "[VIDEO]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

pub fn status_icon(status: StepStatus) -> Emoji<'static, 'static> {
    match status {
        StepStatus::Done => CHECK,
        StepStatus::Error => CROSS,
        StepStatus::Running => RUNNING,
        StepStatus::Idle => IDLE,
    }
}
