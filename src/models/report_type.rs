/// 报告类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// 事件报告
    Incident,
    /// 交通事故报告
    TrafficCrash,
    /// 执法记录仪音视频
    BodyCamera,
    /// 监控录像
    Surveillance,
    /// 911 录音
    #[serde(rename = "recordings_911")]
    Recordings911,
    /// 出警记录
    CallsForService,
    /// 犯罪统计
    CrimeStatistics,
}

impl ReportType {
    /// 门户页面上显示的名称
    pub fn display_name(self) -> &'static str {
        match self {
            ReportType::Incident => "Incident Report",
            ReportType::TrafficCrash => "Traffic Crash",
            ReportType::BodyCamera => "On Body Camera Audio/Video",
            ReportType::Surveillance => "Surveillance Videos",
            ReportType::Recordings911 => "911 Recordings",
            ReportType::CallsForService => "Calls for Service",
            ReportType::CrimeStatistics => "Crime Statistics",
        }
    }

    /// 表单中 radio / option 的 value
    pub fn form_value(self) -> &'static str {
        match self {
            ReportType::Incident => "incident_report",
            ReportType::TrafficCrash => "traffic_crash",
            ReportType::BodyCamera => "body_camera",
            ReportType::Surveillance => "surveillance_video",
            ReportType::Recordings911 => "911_recording",
            ReportType::CallsForService => "calls_for_service",
            ReportType::CrimeStatistics => "crime_statistics",
        }
    }

    /// 是否必须提供案件编号
    pub fn requires_case_number(self) -> bool {
        matches!(
            self,
            ReportType::Incident | ReportType::TrafficCrash | ReportType::Recordings911
        )
    }

    /// 门户保留录音的天数上限（仅 911 录音有）
    pub fn max_age_days(self) -> Option<i64> {
        match self {
            ReportType::Recordings911 => Some(190),
            _ => None,
        }
    }

    /// 从字符串解析（接受 snake_case 和显示名）
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incident" | "incident report" => Some(ReportType::Incident),
            "traffic_crash" | "traffic crash" => Some(ReportType::TrafficCrash),
            "body_camera" | "on body camera audio/video" => Some(ReportType::BodyCamera),
            "surveillance" | "surveillance videos" => Some(ReportType::Surveillance),
            "recordings_911" | "911 recordings" => Some(ReportType::Recordings911),
            "calls_for_service" | "calls for service" => Some(ReportType::CallsForService),
            "crime_statistics" | "crime statistics" => Some(ReportType::CrimeStatistics),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
