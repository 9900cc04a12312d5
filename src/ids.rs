use type_safe_id::{StaticType, TypeSafeId};

macro_rules! typed_id {
    ($marker:ident, $alias:ident, $prefix:literal) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $marker;

        impl StaticType for $marker {
            const TYPE: &'static str = $prefix;
        }

        pub type $alias = TypeSafeId<$marker>;
    };
}

typed_id!(MemoMarker, MemoId, "memo");
// Handed out for drafts before their first create succeeds; never written to the store.
typed_id!(TempMarker, TempId, "temp");
typed_id!(UserMarker, UserId, "user");
typed_id!(GroupMarker, GroupId, "group");
typed_id!(SessionMarker, SessionId, "session");
