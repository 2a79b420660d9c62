use crate::config::PresenceConfig;
use crate::types::{Listener, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// プレゼンス信号（教室チャンネルで周期的に告知されるワイヤ形式）
///
/// ロスターはこの信号の生存集合から導出される。
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PresenceSignal {
    pub user_id: String,
    pub name: String,
    pub language: String,
    pub role: Role,
}

/// ロスターのスナップショット
///
/// `listeners` には生徒のみが含まれ、教師の在席は `teacher_present` で表す。
/// 取得時点の一貫したコピーで、以降の join / leave の影響を受けない。
#[derive(Clone, Debug)]
pub struct RosterSnapshot {
    pub teacher_present: bool,
    pub listeners: Vec<Listener>,
}

struct PresenceEntry {
    listener: Listener,
    name: String,
    last_seen: Instant,
}

/// 教室ごとの在席ロスター
///
/// ハートビート（プレゼンス信号の再送）が継続している間だけ在席とみなし、
/// 猶予期間を超えて途絶えた参加者は `sweep` で退出扱いになる。
/// ブロードキャスタは配信先の決定に `snapshot` のみを使う。
#[derive(Clone)]
pub struct PresenceTracker {
    rosters: Arc<Mutex<HashMap<String, HashMap<String, PresenceEntry>>>>,
    grace_period: Duration,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            rosters: Arc::new(Mutex::new(HashMap::new())),
            grace_period: Duration::from_millis(config.grace_period_ms),
        }
    }

    /// 参加者をロスターに登録（既存ならハートビートとして扱う）
    pub fn join(&self, classroom_id: &str, listener: Listener, name: &str) {
        let mut rosters = self.rosters.lock().unwrap();
        let roster = rosters.entry(classroom_id.to_string()).or_default();

        let listener_id = listener.listener_id.clone();
        let entry = PresenceEntry {
            listener,
            name: name.to_string(),
            last_seen: Instant::now(),
        };

        if roster.insert(listener_id.clone(), entry).is_none() {
            log::info!(
                "教室 {} に参加: {} ({})",
                classroom_id,
                name,
                listener_id
            );
        }
    }

    /// プレゼンス信号をロスターに反映
    ///
    /// 信号には音声設定が含まれないため、TTSは有効として登録される。
    /// 個別設定が必要な場合は `join` を使う。
    pub fn apply_signal(&self, classroom_id: &str, signal: &PresenceSignal) {
        let listener = Listener {
            listener_id: signal.user_id.clone(),
            target_language: signal.language.clone(),
            audio_enabled: true,
            role: signal.role,
        };
        self.join(classroom_id, listener, &signal.name);
    }

    /// プレゼンス信号のJSON行をロスターに反映
    ///
    /// 教室チャンネルから中継された1行を処理する。既知の参加者の
    /// 再通知はハートビートとして扱われる。不正な行は警告して破棄し、
    /// ロスターは変更しない。
    ///
    /// # Returns
    /// 反映できたかどうか
    pub fn apply_signal_line(&self, classroom_id: &str, line: &str) -> bool {
        match serde_json::from_str::<PresenceSignal>(line) {
            Ok(signal) => {
                self.apply_signal(classroom_id, &signal);
                true
            }
            Err(e) => {
                log::warn!("プレゼンス信号のパースに失敗（破棄）: {}", e);
                false
            }
        }
    }

    /// ハートビートを記録
    ///
    /// # Returns
    /// 対象がロスターに存在したかどうか
    pub fn heartbeat(&self, classroom_id: &str, listener_id: &str) -> bool {
        let mut rosters = self.rosters.lock().unwrap();
        if let Some(roster) = rosters.get_mut(classroom_id) {
            if let Some(entry) = roster.get_mut(listener_id) {
                entry.last_seen = Instant::now();
                return true;
            }
        }
        false
    }

    /// 参加者をロスターから除去
    pub fn leave(&self, classroom_id: &str, listener_id: &str) {
        let mut rosters = self.rosters.lock().unwrap();
        if let Some(roster) = rosters.get_mut(classroom_id) {
            if roster.remove(listener_id).is_some() {
                log::info!("教室 {} から退出: {}", classroom_id, listener_id);
            }
            if roster.is_empty() {
                rosters.remove(classroom_id);
            }
        }
    }

    /// ロスターの一貫したスナップショットを取得
    ///
    /// ロスターサイズに比例する計算量で、ロック下でコピーを作る。
    /// 配信中の join / leave はスナップショットに影響しない。
    pub fn snapshot(&self, classroom_id: &str) -> RosterSnapshot {
        let rosters = self.rosters.lock().unwrap();
        let mut teacher_present = false;
        let mut listeners = Vec::new();

        if let Some(roster) = rosters.get(classroom_id) {
            listeners.reserve(roster.len());
            for entry in roster.values() {
                match entry.listener.role {
                    Role::Teacher => teacher_present = true,
                    Role::Student => listeners.push(entry.listener.clone()),
                }
            }
        }

        RosterSnapshot {
            teacher_present,
            listeners,
        }
    }

    /// ハートビートが途絶えた参加者を退出扱いにする
    ///
    /// # Returns
    /// 除去した (教室ID, リスナーID) のリスト
    pub fn sweep(&self) -> Vec<(String, String)> {
        let mut rosters = self.rosters.lock().unwrap();
        let now = Instant::now();
        let mut expired = Vec::new();

        for (classroom_id, roster) in rosters.iter_mut() {
            roster.retain(|listener_id, entry| {
                let alive = now.duration_since(entry.last_seen) <= self.grace_period;
                if !alive {
                    log::info!(
                        "教室 {} のハートビート途絶により退出扱い: {} ({})",
                        classroom_id,
                        entry.name,
                        listener_id
                    );
                    expired.push((classroom_id.clone(), listener_id.clone()));
                }
                alive
            });
        }
        rosters.retain(|_, roster| !roster.is_empty());

        expired
    }
}
