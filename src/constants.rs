// 常量定义

/// 目录布局
pub mod layout {
    /// 连接片段目录
    pub const CONFIG_DIR: &str = "config";
    /// 密钥目录（与 config 平行的分组结构）
    pub const KEYS_DIR: &str = "keys";
    /// 自定义模板目录
    pub const TEMPLATES_DIR: &str = "templates";
    /// 备份根目录
    pub const BACKUPS_DIR: &str = "backups";
    /// 主配置备份子目录
    pub const CONFIG_BACKUPS_DIR: &str = "config-backups";
    /// 片段文件扩展名
    pub const FRAGMENT_EXT: &str = "conf";
    /// 迁移暂存文件后缀
    pub const STAGED_SUFFIX: &str = "conf.staged";
    /// 分组图标元数据
    pub const GROUP_ICONS_FILE: &str = "group-icons.json";
    /// 迁移日志
    pub const MIGRATIONS_FILE: &str = "migrations.json";
}

/// 分组
pub mod groups {
    /// 首次运行创建的默认分组
    pub const DEFAULTS: [&str; 3] = ["work", "personal", "projects"];
    /// 未托管连接所在的虚拟分组
    pub const EXISTING: &str = "existing";
    /// 新建连接未指定分组时使用
    pub const FALLBACK: &str = "personal";
    /// 最大嵌套深度
    pub const MAX_DEPTH: usize = 10;
    /// 分组名称长度范围
    pub const MIN_SEGMENT_LEN: usize = 2;
    pub const MAX_SEGMENT_LEN: usize = 50;
}

/// 图标
pub mod icons {
    /// 片段首行的图标注释前缀
    pub const FRAGMENT_ICON_PREFIX: &str = "# SSH Manager Icon:";
    pub const DEFAULT_CONNECTION: &str = "💻";
    pub const DEFAULT_GROUP: &str = "📁";
}

/// 主配置标记
pub mod markers {
    /// 迁移后注释行的尾部标记
    pub const MIGRATED: &str = "# Migrated to SSH Manager";
    /// 片段头部记录渲染所用模板的注释前缀
    pub const FRAGMENT_TEMPLATE_PREFIX: &str = "# SSH Manager Template:";
}

/// 解析默认值
pub mod defaults {
    pub const HOST: &str = "unknown";
    pub const PORT: u16 = 22;
    pub const KEY_FILE: &str = "~/.ssh/id_ed25519";
    pub const TEMPLATE: &str = "basic-server";
    /// 探测超时（秒）
    pub const PROBE_TIMEOUT_SECS: u64 = 5;
    pub const SSH_BINARY: &str = "ssh";
}

/// 备份清单版本
pub const BACKUP_MANIFEST_VERSION: &str = "1.0";
