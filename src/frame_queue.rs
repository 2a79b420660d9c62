use crate::config::FrameQueueConfig;
use crate::types::{AudioFrame, DropPolicy};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// キャプチャとSTTコネクタの間の有界フレームキュー
///
/// コネクタが遅延した場合でもフレームが無制限に滞留しないよう、
/// 容量超過時はドロップポリシーに従って破棄する。
/// キャプチャ側は決してブロックしない。
pub struct FrameQueue {
    capacity_frames: usize,
    drop_policy: DropPolicy,
    frames: VecDeque<AudioFrame>,
    total_samples: usize,
    dropped_frames: u64,
    sample_rate: u32,
}

impl FrameQueue {
    pub fn new(config: &FrameQueueConfig, sample_rate: u32) -> Self {
        Self {
            capacity_frames: config.capacity_frames,
            drop_policy: config.drop_policy,
            frames: VecDeque::new(),
            total_samples: 0,
            dropped_frames: 0,
            sample_rate,
        }
    }

    /// フレームを追加
    ///
    /// 容量オーバーの場合、ドロップポリシーに従って破棄する。
    pub fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() >= self.capacity_frames {
            match self.drop_policy {
                DropPolicy::DropOldest => {
                    if let Some(dropped) = self.frames.pop_front() {
                        self.total_samples -= dropped.samples.len();
                        self.dropped_frames += 1;
                        log::warn!(
                            "フレームキュー満杯: 最古フレームを破棄 (累計 {} フレーム)",
                            self.dropped_frames
                        );
                    }
                }
                DropPolicy::DropNewest => {
                    self.dropped_frames += 1;
                    log::warn!(
                        "フレームキュー満杯: 新規フレームを破棄 (累計 {} フレーム)",
                        self.dropped_frames
                    );
                    return;
                }
            }
        }

        self.total_samples += frame.samples.len();
        self.frames.push_back(frame);
    }

    /// 受信チャンネルに溜まったフレームをすべてキューへ移す
    ///
    /// キャプチャ側のチャンネルはあくまで受け渡し用で、滞留は
    /// このキューがドロップポリシーに従って引き受ける。
    ///
    /// # Returns
    /// 移したフレーム数
    pub fn drain_from(&mut self, rx: &mut mpsc::Receiver<AudioFrame>) -> usize {
        let mut moved = 0;
        while let Ok(frame) = rx.try_recv() {
            self.push(frame);
            moved += 1;
        }
        moved
    }

    /// 最古のフレームを取り出し
    pub fn pop(&mut self) -> Option<AudioFrame> {
        let frame = self.frames.pop_front();
        if let Some(f) = &frame {
            self.total_samples -= f.samples.len();
        }
        frame
    }

    /// キュー内のフレーム数
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// キューが空かどうか
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// キュー内のデータ時間（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate as f64
    }

    /// これまでに破棄したフレーム数
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// キューをクリア
    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: i16, samples: usize, timestamp_ns: u128) -> AudioFrame {
        AudioFrame {
            samples: vec![value; samples],
            timestamp_ns,
        }
    }

    #[test]
    fn test_push_and_pop_fifo() {
        let config = FrameQueueConfig {
            capacity_frames: 4,
            drop_policy: DropPolicy::DropOldest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        queue.push(frame(1, 2048, 0));
        queue.push(frame(2, 2048, 128_000_000));
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert_eq!(first.samples[0], 1i16);
        let second = queue.pop().unwrap();
        assert_eq!(second.samples[0], 2i16);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_oldest() {
        let config = FrameQueueConfig {
            capacity_frames: 2,
            drop_policy: DropPolicy::DropOldest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        queue.push(frame(1, 2048, 0));
        queue.push(frame(2, 2048, 1));
        queue.push(frame(3, 2048, 2));

        // 最古が破棄され、残りは 2, 3
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_frames(), 1);
        assert_eq!(queue.pop().unwrap().samples[0], 2i16);
        assert_eq!(queue.pop().unwrap().samples[0], 3i16);
    }

    #[test]
    fn test_drop_newest() {
        let config = FrameQueueConfig {
            capacity_frames: 2,
            drop_policy: DropPolicy::DropNewest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        queue.push(frame(1, 2048, 0));
        queue.push(frame(2, 2048, 1));
        queue.push(frame(3, 2048, 2));

        // 新規が破棄され、残りは 1, 2
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_frames(), 1);
        assert_eq!(queue.pop().unwrap().samples[0], 1i16);
        assert_eq!(queue.pop().unwrap().samples[0], 2i16);
    }

    #[tokio::test]
    async fn test_drain_from_overflow_follows_drop_policy() {
        let config = FrameQueueConfig {
            capacity_frames: 4,
            drop_policy: DropPolicy::DropOldest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        // 送信側が詰まっている間にチャンネルへ6フレーム溜まった状況
        let (tx, mut rx) = mpsc::channel(8);
        for i in 1..=6i16 {
            tx.try_send(frame(i, 2048, i as u128)).unwrap();
        }

        let moved = queue.drain_from(&mut rx);
        assert_eq!(moved, 6);

        // 溢れはキューのポリシーが引き受ける: 最古2フレームが破棄される
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dropped_frames(), 2);
        assert_eq!(queue.pop().unwrap().samples[0], 3i16);

        // チャンネルは空になり、以後の到着も移せる
        assert!(rx.try_recv().is_err());
        tx.try_send(frame(7, 2048, 7)).unwrap();
        assert_eq!(queue.drain_from(&mut rx), 1);
    }

    #[tokio::test]
    async fn test_drain_from_drop_newest_keeps_head() {
        let config = FrameQueueConfig {
            capacity_frames: 2,
            drop_policy: DropPolicy::DropNewest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        let (tx, mut rx) = mpsc::channel(8);
        for i in 1..=4i16 {
            tx.try_send(frame(i, 2048, i as u128)).unwrap();
        }

        queue.drain_from(&mut rx);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_frames(), 2);
        assert_eq!(queue.pop().unwrap().samples[0], 1i16);
        assert_eq!(queue.pop().unwrap().samples[0], 2i16);
    }

    #[test]
    fn test_duration_accounting() {
        let config = FrameQueueConfig {
            capacity_frames: 16,
            drop_policy: DropPolicy::DropOldest,
        };
        let mut queue = FrameQueue::new(&config, 16000);

        // 16000サンプル = 1秒分
        queue.push(frame(1, 8000, 0));
        queue.push(frame(2, 8000, 500_000_000));
        assert!((queue.duration_seconds() - 1.0).abs() < f64::EPSILON);

        queue.pop();
        assert!((queue.duration_seconds() - 0.5).abs() < f64::EPSILON);
    }
}
