use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProfile {
    pub name: &'static str,
    pub users: u32,
    pub spawn_rate: u32,
    pub run_time: Duration,
    pub description: &'static str,
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

pub const PROFILES: [LoadProfile; 7] = [
    LoadProfile {
        name: "light",
        users: 50,
        spawn_rate: 5,
        run_time: minutes(10),
        description: "軽負荷（50 ユーザー）",
    },
    LoadProfile {
        name: "normal",
        users: 100,
        spawn_rate: 10,
        run_time: minutes(15),
        description: "通常負荷（100 ユーザー）",
    },
    LoadProfile {
        name: "heavy",
        users: 200,
        spawn_rate: 20,
        run_time: minutes(20),
        description: "高負荷（200 ユーザー）",
    },
    LoadProfile {
        name: "stress",
        users: 300,
        spawn_rate: 30,
        run_time: minutes(15),
        description: "ストレステスト（300 ユーザー）",
    },
    LoadProfile {
        name: "spike",
        users: 500,
        spawn_rate: 50,
        run_time: minutes(10),
        description: "スパイクテスト（500 ユーザー）",
    },
    LoadProfile {
        name: "endurance",
        users: 150,
        spawn_rate: 15,
        run_time: minutes(60),
        description: "耐久テスト（150 ユーザー、1 時間）",
    },
    LoadProfile {
        name: "quick",
        users: 10,
        spawn_rate: 2,
        run_time: Duration::from_secs(30),
        description: "動作確認（10 ユーザー、30 秒）",
    },
];

pub const DEFAULT_PROFILE: &str = "normal";

pub fn profile(name: &str) -> Option<&'static LoadProfile> {
    let name = name.trim();
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn profile_names() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
}
