//! 引擎内置的属性与消息头键名

/// 交换属性键
pub mod property {
    /// 关联 ID：由调用方拥有，扇出机制只在缺失时写入
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const FAILURE_ROUTE_ID: &str = "FailureRouteId";
    pub const FAILURE_ENDPOINT: &str = "FailureEndpoint";
    pub const TO_ENDPOINT: &str = "ToEndpoint";

    pub const MULTICAST_INDEX: &str = "MulticastIndex";
    pub const MULTICAST_COMPLETE: &str = "MulticastComplete";
    pub const SPLIT_INDEX: &str = "SplitIndex";
    pub const SPLIT_SIZE: &str = "SplitSize";
    pub const SPLIT_COMPLETE: &str = "SplitComplete";
    pub const LOOP_INDEX: &str = "LoopIndex";
    pub const LOOP_SIZE: &str = "LoopSize";
    pub const SLIP_ENDPOINT: &str = "SlipEndpoint";
    pub const RECIPIENT_LIST_ENDPOINT: &str = "RecipientListEndpoint";

    pub const FILTER_MATCHED: &str = "FilterMatched";
    pub const DUPLICATE_MESSAGE: &str = "DuplicateMessage";

    pub const AGGREGATED_SIZE: &str = "AggregatedSize";
    pub const AGGREGATED_COMPLETED_BY: &str = "AggregatedCompletedBy";
    pub const AGGREGATED_CORRELATION_KEY: &str = "AggregatedCorrelationKey";
}

/// 消息头键
pub mod header {
    pub const REDELIVERED: &str = "Redelivered";
    pub const REDELIVERY_COUNTER: &str = "RedeliveryCounter";
    pub const REDELIVERY_MAX_COUNTER: &str = "RedeliveryMaxCounter";
    pub const REDELIVERY_DELAY: &str = "RedeliveryDelay";
}
