//! 割り込みコンテキストの登録
//!
//! エミュレータ本体は1つだけ登録でき、登録時に得た型付きハンドルを通して
//! 各割り込み入口とメイン tick から操作する。クリティカルセクションはミューテックスで表す
//! （実機では割り込み禁止区間に相当）。

use crate::emulator::{EmulatorError, FloppyEmulator};
use crate::hal::DrivePins;
use crate::storage::StorageBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 登録済みフラグ（プロセス全体で1つ）
static REGISTERED: AtomicBool = AtomicBool::new(false);

struct Registration<T> {
    inner: Mutex<T>,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        REGISTERED.store(false, Ordering::Release);
    }
}

/// 登録済みコンテキストへのハンドル
///
/// clone して各コンテキストへ配る。最後のハンドルが破棄されると登録が解除される。
pub struct IrqContext<T> {
    reg: Arc<Registration<T>>,
}

impl<T> Clone for IrqContext<T> {
    fn clone(&self) -> Self {
        IrqContext {
            reg: Arc::clone(&self.reg),
        }
    }
}

impl<T> IrqContext<T> {
    /// 値を登録する（すでに登録済みならエラー）
    pub fn register(value: T) -> Result<Self, EmulatorError> {
        if REGISTERED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EmulatorError::AlreadyRegistered);
        }
        Ok(IrqContext {
            reg: Arc::new(Registration {
                inner: Mutex::new(value),
            }),
        })
    }

    /// クリティカルセクション内で操作する
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // 割り込み側で panic しても状態は使い続ける
        self.reg.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P: DrivePins, S: StorageBackend> IrqContext<FloppyEmulator<P, S>> {
    /// WE エッジ割り込み
    pub fn write_request_irq(&self) {
        self.with(|emu| {
            emu.on_write_request_changed();
        });
    }

    /// 書き込みデータのエッジ割り込み
    pub fn write_transition_irq(&self) {
        self.with(|emu| emu.on_write_transition());
    }

    /// 4µsサンプルタイマー割り込み
    pub fn sample_timer_irq(&self) {
        self.with(|emu| emu.on_sample_timer());
    }

    /// メインループの tick
    pub fn tick(&self, elapsed_us: u32) {
        self.with(|emu| emu.tick(elapsed_us));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatorOptions;
    use crate::sim::SimPins;
    use crate::storage::MemoryStorage;

    // 登録はプロセス全体で1つなので、このテスト1つにまとめる
    #[test]
    fn test_single_registration() {
        let pins = SimPins::new();
        let emu = FloppyEmulator::new(pins.clone(), MemoryStorage::new(), EmulatorOptions::default());
        let ctx = IrqContext::register(emu).unwrap();

        let second = FloppyEmulator::new(pins.clone(), MemoryStorage::new(), EmulatorOptions::default());
        assert!(matches!(
            IrqContext::register(second),
            Err(EmulatorError::AlreadyRegistered)
        ));

        let isr = ctx.clone();
        let handle = std::thread::spawn(move || {
            isr.tick(100);
            isr.with(|emu| emu.logical_track())
        });
        assert_eq!(handle.join().unwrap(), 17);

        pins.set_selected(true);
        pins.set_write_enabled(true);
        ctx.write_request_irq();
        assert!(ctx.with(|emu| emu.capture_state() == crate::capture::CaptureState::Sampling));
        ctx.write_transition_irq();
        ctx.sample_timer_irq();
        pins.set_write_enabled(false);
        ctx.write_request_irq();
        assert_eq!(ctx.with(|emu| emu.capture_stats().no_sync), 1);

        drop(ctx);
        let again = FloppyEmulator::new(pins, MemoryStorage::new(), EmulatorOptions::default());
        assert!(IrqContext::register(again).is_ok());
    }
}
