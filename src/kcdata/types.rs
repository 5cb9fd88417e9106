//! Item type numbers.
//!
//! Generic kcdata types occupy the low range; stackshot payloads live at
//! `0x900` and above. A reader skips any type it does not know by length.

pub const TYPE_INVALID: u32 = 0x0;
pub const TYPE_STRING_DESC: u32 = 0x1;
pub const TYPE_UINT32_DESC: u32 = 0x2;
pub const TYPE_UINT64_DESC: u32 = 0x3;
pub const TYPE_CONTAINER_BEGIN: u32 = 0x13;
pub const TYPE_CONTAINER_END: u32 = 0x14;
/// Arrays use `TYPE_ARRAY_PAD0 + pad`, so `0x20..=0x2f` are all arrays.
pub const TYPE_ARRAY_PAD0: u32 = 0x20;
pub const TYPE_LIBRARY_LOADINFO64: u32 = 0x31;
pub const TYPE_TIMEBASE: u32 = 0x32;
pub const TYPE_MACH_ABSOLUTE_TIME: u32 = 0x33;
pub const TYPE_USECS_SINCE_EPOCH: u32 = 0x35;
pub const TYPE_COMPRESS_HEADER: u32 = 0x40;

pub const BUFFER_BEGIN_STACKSHOT: u32 = 0x59a2_5807;
pub const BUFFER_BEGIN_DELTA_STACKSHOT: u32 = 0xde17_a59a;
pub const BUFFER_BEGIN_COMPRESSED: u32 = 0x434f_4d50;
pub const BUFFER_END: u32 = 0xf191_58ed;

/// Compression algorithm tag stored in the compress header.
pub const COMPRESS_ZLIB: u64 = 1;

pub const STACKSHOT_IOSTATS: u32 = 0x901;
pub const STACKSHOT_GLOBAL_MEM_STATS: u32 = 0x902;
pub const STACKSHOT_CONTAINER_TASK: u32 = 0x903;
pub const STACKSHOT_CONTAINER_THREAD: u32 = 0x904;
pub const STACKSHOT_TASK_SNAPSHOT: u32 = 0x905;
pub const STACKSHOT_THREAD_SNAPSHOT: u32 = 0x906;
pub const STACKSHOT_SHAREDCACHE_LOADINFO: u32 = 0x908;
pub const STACKSHOT_THREAD_NAME: u32 = 0x909;
pub const STACKSHOT_BOOTARGS: u32 = 0x90e;
pub const STACKSHOT_OSVERSION: u32 = 0x90f;
pub const STACKSHOT_KERN_PAGE_SIZE: u32 = 0x910;
pub const STACKSHOT_JETSAM_LEVEL: u32 = 0x911;
pub const STACKSHOT_DELTA_SINCE_TIMESTAMP: u32 = 0x912;
pub const STACKSHOT_KERN_STACKLR64: u32 = 0x914;
pub const STACKSHOT_USER_STACKLR64: u32 = 0x916;
pub const STACKSHOT_CPU_TIMES: u32 = 0x919;
pub const STACKSHOT_DURATION: u32 = 0x91a;
pub const STACKSHOT_FAULT_STATS: u32 = 0x91b;
pub const STACKSHOT_THREAD_WAITINFO: u32 = 0x91d;
pub const STACKSHOT_THREAD_GROUP_SNAPSHOT: u32 = 0x91e;
pub const STACKSHOT_THREAD_GROUP: u32 = 0x91f;
pub const STACKSHOT_JETSAM_COALITION_SNAPSHOT: u32 = 0x920;
pub const STACKSHOT_JETSAM_COALITION: u32 = 0x921;
pub const STACKSHOT_THREAD_POLICY_VERSION: u32 = 0x922;
pub const STACKSHOT_INSTRS_CYCLES: u32 = 0x923;
pub const STACKSHOT_PAGE_TABLES: u32 = 0x926;
pub const STACKSHOT_SYS_SHAREDCACHE_LAYOUT: u32 = 0x927;
pub const STACKSHOT_THREAD_DISPATCH_QUEUE_LABEL: u32 = 0x928;
pub const STACKSHOT_THREAD_TURNSTILEINFO: u32 = 0x929;
pub const STACKSHOT_TASK_CPU_ARCHITECTURE: u32 = 0x92a;
pub const STACKSHOT_TASK_DELTA_SNAPSHOT: u32 = 0x940;
pub const STACKSHOT_THREAD_DELTA_SNAPSHOT: u32 = 0x941;
pub const STACKSHOT_TRANSITIONING_TASK_SNAPSHOT: u32 = 0x94b;
pub const STACKSHOT_CONTAINER_TRANSITIONING_TASK: u32 = 0x94c;
pub const STACKSHOT_CONTAINER_PORTLABEL: u32 = 0x94f;
pub const STACKSHOT_PORTLABEL: u32 = 0x950;
pub const STACKSHOT_PORTLABEL_NAME: u32 = 0x951;
pub const STACKSHOT_PORTLABEL_STATS: u32 = 0x952;

/// Thread snapshot layout revision echoed in the prologue.
pub const THREAD_POLICY_VERSION: u32 = 2;

/// Human readable name for a type number, used by the inspector.
pub fn type_name(kind: u32) -> &'static str {
    match kind {
        TYPE_STRING_DESC => "string_desc",
        TYPE_UINT32_DESC => "uint32_desc",
        TYPE_UINT64_DESC => "uint64_desc",
        TYPE_CONTAINER_BEGIN => "container_begin",
        TYPE_CONTAINER_END => "container_end",
        TYPE_LIBRARY_LOADINFO64 => "dyld_load_info",
        TYPE_TIMEBASE => "mach_timebase_info",
        TYPE_MACH_ABSOLUTE_TIME => "mach_absolute_time",
        TYPE_USECS_SINCE_EPOCH => "usecs_since_epoch",
        TYPE_COMPRESS_HEADER => "kcdata_compress_header",
        BUFFER_BEGIN_STACKSHOT => "kcdata_stackshot",
        BUFFER_BEGIN_DELTA_STACKSHOT => "kcdata_delta_stackshot",
        BUFFER_BEGIN_COMPRESSED => "kcdata_compressed",
        BUFFER_END => "buffer_end",
        STACKSHOT_IOSTATS => "io_statistics",
        STACKSHOT_GLOBAL_MEM_STATS => "mem_and_io_snapshot",
        STACKSHOT_CONTAINER_TASK => "task_snapshots",
        STACKSHOT_CONTAINER_THREAD => "thread_snapshots",
        STACKSHOT_TASK_SNAPSHOT => "task_snapshot",
        STACKSHOT_THREAD_SNAPSHOT => "thread_snapshot",
        STACKSHOT_SHAREDCACHE_LOADINFO => "shared_cache_dyld_load_info",
        STACKSHOT_THREAD_NAME => "pth_name",
        STACKSHOT_BOOTARGS => "boot_args",
        STACKSHOT_OSVERSION => "osversion",
        STACKSHOT_KERN_PAGE_SIZE => "kernel_page_size",
        STACKSHOT_JETSAM_LEVEL => "jetsam_level",
        STACKSHOT_DELTA_SINCE_TIMESTAMP => "stackshot_delta_since_timestamp",
        STACKSHOT_KERN_STACKLR64 => "kernel_stack_frames",
        STACKSHOT_USER_STACKLR64 => "user_stack_frames",
        STACKSHOT_CPU_TIMES => "cpu_times",
        STACKSHOT_DURATION => "stackshot_duration",
        STACKSHOT_FAULT_STATS => "stackshot_fault_stats",
        STACKSHOT_THREAD_WAITINFO => "thread_waitinfo",
        STACKSHOT_THREAD_GROUP_SNAPSHOT => "thread_group_snapshot",
        STACKSHOT_THREAD_GROUP => "thread_group",
        STACKSHOT_JETSAM_COALITION_SNAPSHOT => "jetsam_coalition_snapshot",
        STACKSHOT_JETSAM_COALITION => "jetsam_coalition",
        STACKSHOT_THREAD_POLICY_VERSION => "thread_policy_version",
        STACKSHOT_INSTRS_CYCLES => "instrs_cycles_snapshot",
        STACKSHOT_PAGE_TABLES => "vm_page_tables",
        STACKSHOT_SYS_SHAREDCACHE_LAYOUT => "system_shared_cache_layout",
        STACKSHOT_THREAD_DISPATCH_QUEUE_LABEL => "dispatch_queue_label",
        STACKSHOT_THREAD_TURNSTILEINFO => "thread_turnstileinfo",
        STACKSHOT_TASK_CPU_ARCHITECTURE => "task_cpu_architecture",
        STACKSHOT_TASK_DELTA_SNAPSHOT => "task_delta_snapshot",
        STACKSHOT_THREAD_DELTA_SNAPSHOT => "thread_delta_snapshot",
        STACKSHOT_TRANSITIONING_TASK_SNAPSHOT => "transitioning_task_snapshot",
        STACKSHOT_CONTAINER_TRANSITIONING_TASK => "transitioning_task_snapshots",
        STACKSHOT_CONTAINER_PORTLABEL => "portlabels",
        STACKSHOT_PORTLABEL => "portlabel_info",
        STACKSHOT_PORTLABEL_NAME => "portlabel_name",
        STACKSHOT_PORTLABEL_STATS => "portlabel_hash_stats",
        k if (TYPE_ARRAY_PAD0..=TYPE_ARRAY_PAD0 + 0xf).contains(&k) => "array",
        _ => "unknown",
    }
}
